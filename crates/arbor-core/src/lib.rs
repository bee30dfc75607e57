//! Arbor Core - keys, particles, aggregates, wire payloads, and error handling

pub mod data;
pub mod error;
pub mod protocol;
pub mod types;

pub use data::{BoundingBox, CentroidData, Data};
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
