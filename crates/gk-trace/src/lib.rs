//! # gk-trace
//!
//! Append-only execution trace for Gatekeeper.
//!
//! [`TraceRecorder`] is the only writer. It assigns every event a sequence
//! number that is contiguous from 0 per action, and commits the event only
//! after its [`TraceSink`] (if any) accepted it. [`JsonlSink`] keeps a
//! SHA-256 hash chain across lines so tampering is detectable with
//! [`JsonlSink::verify_chain`].

pub mod error;
pub mod event;
pub mod hasher;
pub mod recorder;
pub mod sink;

pub use error::TraceError;
pub use event::{ExecutionStatus, TraceEvent, TraceEventKind, TraceEventType};
pub use recorder::{TraceFilter, TraceQuery, TraceRecorder};
pub use sink::{JsonlSink, MemorySink, TraceSink};
