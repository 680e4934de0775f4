//! Shared types for the Trellis pipeline engine.
//!
//! Everything the other Trellis crates have in common lives here:
//! - [`TrellisError`] — unified error taxonomy
//! - [`Value`] — typed attribute values (string, int, float, bool, duration)
//! - [`Context`] — thread-safe key-value store for pipeline state
//! - [`Outcome`] — result of executing a node handler
//! - [`Checkpoint`] — rolling snapshot for resume after interruption

pub mod checkpoint;
pub mod context;
pub mod error;
pub mod outcome;
pub mod value;

pub use checkpoint::Checkpoint;
pub use context::Context;
pub use error::{Result, TrellisError};
pub use outcome::{Outcome, StageStatus};
pub use value::Value;
