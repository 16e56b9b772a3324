pub mod bringup;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod lcore;
pub mod test_util;

pub use bringup::{Dataplane, DataplaneContext, initialize, initialize_on};
pub use config::{ConfigError, EchoConfig};
pub use error::BringUpError;
