pub mod config;
pub mod error;
pub mod paths;

pub use config::Config;
pub use error::{Error, Result};
pub use paths::Paths;

/// Name reported in `serverInfo` and `/health`.
pub const SERVICE_NAME: &str = "gasoline";
