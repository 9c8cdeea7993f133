//! Shared building blocks for the granite tablet server: error taxonomy,
//! configuration, identifiers, hybrid time and the hybrid clock.

pub mod clock;
pub mod config;
pub mod datum;
pub mod error;
pub mod hybrid_time;
pub mod schema;
pub mod shutdown;
pub mod types;

pub use error::{GraniteError, GraniteResult};
pub use hybrid_time::{HybridTime, HybridTimeLease};
pub use types::{OpId, TabletId};
