pub mod fts;
pub mod json;
pub mod language;
pub mod paging;
pub mod params;
pub mod registry;
pub mod result;
pub mod server;
pub mod sql;

pub use fts::{FtsLanguage, FtsQuery, FTS_LANGUAGE};
pub use json::{JsonResultSet, SuggesterResult};
pub use language::{AccessFilter, AllowAll, IndexContext, QueryLanguage};
pub use paging::{select_window, PageBudget, PagedResultSet};
pub use params::{
    Connective, LimitBy, MlAnalysisMode, QueryOptions, SearchParameters, SortBy, SortDefinition,
};
pub use registry::QueryRegistry;
pub use result::{HitResultSet, LimitReason, ResultRow, ResultSet, RowCursor};
pub use server::QueryServer;
pub use sql::{SqlLanguage, CMIS_ALFRESCO, CMIS_STRICT};
