//! Core types, errors, and the wire protocol for tandem.
//!
//! Everything shared between the service side (`tandem-service`) and the
//! worker side (`tandem-worker`) lives here: the `Error` enum and `Result`
//! alias, the request/response message types, the line codec, and the
//! task status model.

pub mod errors;
pub mod protocol;

pub use errors::{Error, Result};
pub use protocol::{
    decode, encode, Args, Request, Response, ResponseType, TaskStatus,
};
