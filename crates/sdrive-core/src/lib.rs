pub mod b64;
pub mod config;
pub mod error;
pub mod types;

pub use error::{SdriveError, SdriveResult};
