//! Worker-side building blocks: the task context handed to running
//! scripts, the execution lanes, and the script engine seam.
//!
//! The binary in `main.rs` wires these together into the worker process
//! contract: requests on stdin, responses on stdout, logs on stderr.

pub mod context;
pub mod engine;
pub mod lanes;

pub use context::TaskContext;
pub use engine::{engine_for, Outcome, ScriptEngine, ScriptError};
pub use lanes::{spawn_writer, Job, Lanes};
