//! Named shared memory regions and NDArray descriptors.
//!
//! Array payloads can be gigabytes, so they never travel through the text
//! protocol. The producing side writes bytes into a named region and sends
//! only a small descriptor (region name, shape, dtype) inline; the receiving
//! side attaches to the same physical memory, making the transfer zero-copy.
//!
//! Unix only: regions live in the POSIX shared-memory namespace
//! (`shm_open`/`shm_unlink`).

pub mod ndarray;
pub mod region;

pub use ndarray::{DType, NDArray, Order, ShmToken};
pub use region::SharedMemory;
