pub mod config;
pub mod error;
pub mod remote;
pub mod store;
pub mod task;
pub mod xcluster;

pub use config::Config;
pub use error::{Error, Result};
pub use xcluster::{Services, XClusterService};
