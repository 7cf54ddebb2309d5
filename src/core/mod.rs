pub mod adaptive;
pub mod collation;
pub mod config;
pub mod document;
pub mod error;
pub mod status;

pub use adaptive::*;
pub use collation::Collation;
pub use config::{IndexerOptions, ManagerOptions, StorageType};
pub use document::*;
pub use error::{Result, ViewError};
pub use status::Status;
