//! Execution context handed to a running script.
//!
//! The lane passes the context explicitly rather than through any
//! ambient "current task" state, so an engine only ever sees its own
//! cancel flag, update sink, and output map.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use serde_json::Value;

use tandem_core::{Args, Response};

pub struct TaskContext {
    uuid: String,
    cancel: Arc<AtomicBool>,
    responses: Sender<Response>,
    outputs: Mutex<Args>,
}

impl TaskContext {
    pub(crate) fn new(uuid: String, cancel: Arc<AtomicBool>, responses: Sender<Response>) -> Self {
        Self {
            uuid,
            cancel,
            responses,
            outputs: Mutex::new(Args::new()),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Advisory cancellation flag. Scripts are expected to poll this and
    /// terminate cooperatively; nothing preempts them.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Emit an UPDATE with whichever progress fields the script supplied.
    pub fn update(&self, message: Option<String>, current: Option<i64>, maximum: Option<i64>) {
        let _ = self.responses.send(Response::Update {
            task: self.uuid.clone(),
            message,
            current,
            maximum,
        });
    }

    /// Record one output value.
    pub fn set_output(&self, key: impl Into<String>, value: Value) {
        self.outputs.lock().insert(key.into(), value);
    }

    pub(crate) fn take_outputs(&self) -> Args {
        std::mem::take(&mut *self.outputs.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use serde_json::json;

    #[test]
    fn update_emits_response() {
        let (tx, rx) = unbounded();
        let ctx = TaskContext::new("t1".to_string(), Arc::new(AtomicBool::new(false)), tx);
        ctx.update(Some("step".to_string()), Some(1), Some(10));

        match rx.try_recv().unwrap() {
            Response::Update {
                task,
                message,
                current,
                maximum,
            } => {
                assert_eq!(task, "t1");
                assert_eq!(message.as_deref(), Some("step"));
                assert_eq!(current, Some(1));
                assert_eq!(maximum, Some(10));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn outputs_accumulate_and_drain() {
        let (tx, _rx) = unbounded();
        let ctx = TaskContext::new("t2".to_string(), Arc::new(AtomicBool::new(false)), tx);
        ctx.set_output("a", json!(1));
        ctx.set_output("b", json!("two"));

        let outputs = ctx.take_outputs();
        assert_eq!(outputs.len(), 2);
        assert!(ctx.take_outputs().is_empty());
    }

    #[test]
    fn cancel_flag_visible() {
        let (tx, _rx) = unbounded();
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new("t3".to_string(), flag.clone(), tx);
        assert!(!ctx.cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(ctx.cancelled());
    }
}
