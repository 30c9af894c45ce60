//! Client-side surface of tandem: launch a worker process, submit tasks to
//! it, and observe their progress.
//!
//! A [`Service`] owns exactly one worker process and the dispatch loop that
//! reads its responses. [`Task`] handles are created through the service,
//! started explicitly, and settle in a terminal state (complete, canceled,
//! failed, or crashed). [`Environment`] resolves which executable to launch.
//!
//! ```no_run
//! # async fn demo() -> tandem_core::Result<()> {
//! use tandem_service::Environment;
//!
//! let service = Environment::system().worker()?;
//! let task = service.task("2+2", Default::default())?;
//! task.start().await?;
//! task.wait_for(None).await?;
//! assert_eq!(task.outputs().get("result"), Some(&serde_json::json!(4)));
//! service.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod environment;
pub mod service;
pub mod task;

pub use environment::Environment;
pub use service::Service;
pub use task::{Task, TaskEvent};

pub use tandem_core::{Args, Error, ResponseType, Result, TaskStatus};
pub use tandem_shm::{DType, NDArray, Order, SharedMemory, ShmToken};
