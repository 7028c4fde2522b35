pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod services;

pub use error::{Error, Result};
