pub mod change;
pub mod content;
pub mod types;

pub use change::*;
pub use content::*;
pub use types::*;
