pub mod cli;
pub mod config;
pub mod error;
pub mod fs;
pub mod path;
pub mod remote;

pub use config::Config;
pub use error::{Error, Result};
