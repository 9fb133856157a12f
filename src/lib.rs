pub mod config;
pub mod core;
pub mod execution;
pub mod ingest;
pub mod transport;

pub use crate::core::*;
