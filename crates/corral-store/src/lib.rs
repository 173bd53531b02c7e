pub mod database;
pub mod error;
pub mod replay;
pub mod row_helpers;
pub mod sandboxes;
pub mod schema;
pub mod sessions;
pub mod usage_log;
pub mod workflows;

pub use database::Database;
pub use error::StoreError;
