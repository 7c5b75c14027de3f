//! Parcel Dispatch — bounded, pull-based worker pool for deferred parcel work.

pub mod config;
pub mod error;
pub mod intake;
pub mod pool;

pub use error::{Error, Result};
