pub mod config;
pub mod error;
pub mod logging;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::*;
pub use error::*;
pub use logging::OperationLog;
pub use types::*;
