//! Common utilities and types shared across repfs

pub mod config;
pub mod error;
pub mod net;
pub mod proto;

pub use config::{ControllerConfig, FileConfig, NodeConfig};
pub use error::{Error, Result};
pub use net::LineSender;
