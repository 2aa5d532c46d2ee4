//! Streaming transcript assembly.
//!
//! Events flow from a [`StreamDriver`] into a [`TranscriptAssembler`], which
//! folds them into messages and publishes a [`Snapshot`] after every change.

pub mod assembler;
pub mod driver;
pub mod handler;
pub mod partial_json;
pub mod registry;
pub mod snapshot;

pub use assembler::{LastEventKind, Transcript, TranscriptAssembler, Transition};
pub use driver::{CancelHandle, StreamDriver, StreamStats};
pub use handler::{handler_fn, FnToolCallHandler, ToolCallHandler};
pub use partial_json::parse_partial;
pub use registry::{RegistryEntry, ToolCallRegistry};
pub use snapshot::{Snapshot, SnapshotEmitter};
