//! KDL configuration parsing for Conveyor.
//!
//! One explicit [`Config`] value is parsed at startup and passed by
//! reference to the queue, the project registry and the request
//! handlers. There is no process-wide configuration global.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{Config, ProjectConfig, QueueConfig, ServerConfig};
