pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod fileio;
pub mod frontend;
pub mod lease;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod shutdown;

pub use error::{JobError, Result};
