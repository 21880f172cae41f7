pub mod config;
pub mod error;
pub mod types;
pub mod url;

pub use config::AppConfig;
pub use error::{CrawlError, StoreError};
pub use types::*;
