pub mod multi_reader;
pub mod tokenizer;

pub use multi_reader::{read_to_string, CharSource, MultiReader, StrSource};
pub use tokenizer::{normalize_term, tokenize, tokenize_str};
