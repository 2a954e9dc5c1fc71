pub mod config;
pub mod logging;
pub mod paths;
pub mod remoting;

pub use config::{Config, ConfigError, LogLevel, LoggingConfig, RemotingConfig, ValidationError};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};
pub use remoting::{RemotingDirection, RemotingMode, SignatureScope};

pub const APP_NAME: &str = "encore";
pub const APP_AUTHOR: &str = "Encore";
pub const APP_QUALIFIER: &str = "io";
