//! Task handles and their state machine.
//!
//! All state mutation driven by worker responses happens on the service's
//! dispatch loop, which is the sole caller of [`Task::handle`]. Caller
//! threads only read snapshots or issue `start`/`cancel`/`wait_for`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use tandem_core::{Args, Error, Request, Response, ResponseType, Result, TaskStatus};

use crate::service::ServiceInner;

/// Event delivered to task listeners: the response kind plus the fields it
/// carried. The task handle gives access to the resulting state.
#[derive(Clone)]
pub struct TaskEvent {
    pub task: Task,
    pub response_type: ResponseType,
    pub message: Option<String>,
    pub current: Option<i64>,
    pub maximum: Option<i64>,
}

impl std::fmt::Debug for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEvent")
            .field("task", &self.task.uuid())
            .field("response_type", &self.response_type)
            .field("message", &self.message)
            .field("current", &self.current)
            .field("maximum", &self.maximum)
            .finish()
    }
}

type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

struct TaskState {
    status: TaskStatus,
    message: Option<String>,
    current: i64,
    maximum: i64,
    outputs: Args,
    error: Option<String>,
    listeners: Vec<Listener>,
}

pub(crate) struct TaskInner {
    uuid: String,
    script: String,
    inputs: Args,
    queue: Option<String>,
    service: Weak<ServiceInner>,
    state: Mutex<TaskState>,
    terminal: watch::Sender<bool>,
}

/// Handle to one unit of work submitted to the worker. Cheap to clone;
/// all clones observe the same underlying task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(
        service: Weak<ServiceInner>,
        script: &str,
        inputs: Args,
        queue: Option<&str>,
    ) -> Self {
        let (terminal, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                uuid: Uuid::new_v4().simple().to_string(),
                script: script.to_string(),
                inputs,
                queue: queue.map(str::to_string),
                service,
                state: Mutex::new(TaskState {
                    status: TaskStatus::Initial,
                    message: None,
                    current: 0,
                    maximum: 1,
                    outputs: Args::new(),
                    error: None,
                    listeners: Vec::new(),
                }),
                terminal,
            }),
        }
    }

    /// The task id, unique within the owning service's lifetime.
    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    /// Latest progress message, if the script reported one.
    pub fn message(&self) -> Option<String> {
        self.inner.state.lock().message.clone()
    }

    pub fn current(&self) -> i64 {
        self.inner.state.lock().current
    }

    pub fn maximum(&self) -> i64 {
        self.inner.state.lock().maximum
    }

    /// Output mapping; populated only once the task is complete.
    pub fn outputs(&self) -> Args {
        self.inner.state.lock().outputs.clone()
    }

    /// Error text; populated only when the task failed or crashed.
    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    /// Register a listener, fired in registration order for every response
    /// addressed to this task. Only legal before `start()`, so no event can
    /// be missed.
    pub fn listen(&self, listener: impl Fn(&TaskEvent) + Send + Sync + 'static) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.status != TaskStatus::Initial {
            return Err(Error::invalid_state("INITIAL", st.status.to_string()));
        }
        st.listeners.push(Arc::new(listener));
        Ok(())
    }

    /// Queue the task and send EXECUTE to the worker. Calling twice is an
    /// invalid-state error.
    pub async fn start(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if st.status != TaskStatus::Initial {
                return Err(Error::invalid_state("INITIAL", st.status.to_string()));
            }
            st.status = TaskStatus::Queued;
        }
        let request = Request::Execute {
            task: self.inner.uuid.clone(),
            script: self.inner.script.clone(),
            inputs: self.inner.inputs.clone(),
            queue: self.inner.queue.clone(),
        };
        self.send(request).await
    }

    /// Request cancellation. A task that was never started is canceled
    /// locally and will never run; a queued or running task gets a CANCEL
    /// request and settles when the worker answers CANCELATION. Canceling
    /// a terminal task is a no-op.
    pub async fn cancel(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            match st.status {
                TaskStatus::Initial => {
                    st.status = TaskStatus::Canceled;
                    let listeners = st.listeners.clone();
                    drop(st);
                    self.fire(ResponseType::Cancelation, None, None, None, &listeners);
                    self.settle();
                    return Ok(());
                }
                status if status.is_terminal() => return Ok(()),
                _ => {}
            }
        }
        self.send(Request::Cancel {
            task: self.inner.uuid.clone(),
        })
        .await
    }

    /// Wait until the task reaches a terminal state, starting it first if
    /// it was never started. With a timeout, elapses without altering the
    /// task's state; the task may still settle later.
    pub async fn wait_for(&self, timeout: Option<Duration>) -> Result<TaskStatus> {
        if self.status() == TaskStatus::Initial {
            self.start().await?;
        }
        let mut rx = self.inner.terminal.subscribe();
        let settled = rx.wait_for(|done| *done);
        match timeout {
            Some(duration) => {
                tokio::time::timeout(duration, settled)
                    .await
                    .map_err(|_| Error::Timeout {
                        operation: "wait_for".to_string(),
                        duration,
                    })?
                    .map_err(|_| Error::protocol("task channel closed"))?;
            }
            None => {
                settled
                    .await
                    .map_err(|_| Error::protocol("task channel closed"))?;
            }
        }
        Ok(self.status())
    }

    async fn send(&self, request: Request) -> Result<()> {
        let service = self
            .inner
            .service
            .upgrade()
            .ok_or_else(|| Error::invalid_state("open service", "dropped"))?;
        service.send(&request).await
    }

    /// Apply one worker response. Dispatch-loop only: the loop is the sole
    /// mutator of task state, so listeners always fire on its thread and
    /// strictly before the next response is processed.
    pub(crate) fn handle(&self, response: Response) {
        let kind = response.kind();
        let mut st = self.inner.state.lock();
        if st.status.is_terminal() {
            tracing::warn!(
                task = %self.inner.uuid,
                response = %kind,
                "ignoring message addressed to a terminal task"
            );
            return;
        }

        let (mut message, mut current, mut maximum) = (None, None, None);
        match response {
            Response::Launch { .. } => st.status = TaskStatus::Running,
            Response::Update {
                message: m,
                current: c,
                maximum: x,
                ..
            } => {
                if let Some(m) = &m {
                    st.message = Some(m.clone());
                }
                if let Some(c) = c {
                    st.current = c;
                }
                if let Some(x) = x {
                    st.maximum = x;
                }
                (message, current, maximum) = (m, c, x);
            }
            Response::Completion { outputs, .. } => {
                st.status = TaskStatus::Complete;
                for (key, value) in outputs {
                    st.outputs.insert(key, value);
                }
            }
            Response::Cancelation { .. } => st.status = TaskStatus::Canceled,
            Response::Failure { error, .. } => {
                st.status = TaskStatus::Failed;
                st.error = error;
            }
            Response::Crash { error } => {
                st.status = TaskStatus::Crashed;
                st.error =
                    Some(error.unwrap_or_else(|| "worker process crashed".to_string()));
            }
        }

        let status = st.status;
        let listeners = st.listeners.clone();
        drop(st);

        self.fire(kind, message, current, maximum, &listeners);
        if status.is_terminal() {
            self.settle();
        }
    }

    /// Drive a non-terminal task to Crashed after the worker died.
    pub(crate) fn crash(&self, message: &str) {
        self.handle(Response::Crash {
            error: Some(message.to_string()),
        });
    }

    fn fire(
        &self,
        response_type: ResponseType,
        message: Option<String>,
        current: Option<i64>,
        maximum: Option<i64>,
        listeners: &[Listener],
    ) {
        let event = TaskEvent {
            task: self.clone(),
            response_type,
            message,
            current,
            maximum,
        };
        for listener in listeners {
            // One misbehaving listener must not starve the rest.
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(task = %self.inner.uuid, "task listener panicked");
            }
        }
    }

    /// Mark the task settled and drop it from the service registry.
    fn settle(&self) {
        // send_replace stores the value even with no receiver subscribed
        // yet, so a wait_for that arrives after settlement still resolves.
        self.inner.terminal.send_replace(true);
        if let Some(service) = self.inner.service.upgrade() {
            service.forget(&self.inner.uuid);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("uuid", &self.inner.uuid)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached() -> Task {
        Task::new(Weak::new(), "2+2", Args::new(), None)
    }

    fn completion(task: &Task, outputs: Args) -> Response {
        Response::Completion {
            task: task.uuid().to_string(),
            outputs,
        }
    }

    #[test]
    fn launch_then_completion() {
        let task = detached();
        assert_eq!(task.status(), TaskStatus::Initial);

        task.handle(Response::Launch {
            task: task.uuid().to_string(),
        });
        assert_eq!(task.status(), TaskStatus::Running);

        let mut outputs = Args::new();
        outputs.insert("result".to_string(), json!(4));
        task.handle(completion(&task, outputs));
        assert_eq!(task.status(), TaskStatus::Complete);
        assert_eq!(task.outputs().get("result"), Some(&json!(4)));
    }

    #[test]
    fn update_tracks_progress_without_state_change() {
        let task = detached();
        task.handle(Response::Launch {
            task: task.uuid().to_string(),
        });
        task.handle(Response::Update {
            task: task.uuid().to_string(),
            message: Some("halfway".to_string()),
            current: Some(5),
            maximum: Some(10),
        });
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.message().as_deref(), Some("halfway"));
        assert_eq!(task.current(), 5);
        assert_eq!(task.maximum(), 10);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let task = detached();
        task.handle(Response::Cancelation {
            task: task.uuid().to_string(),
        });
        assert_eq!(task.status(), TaskStatus::Canceled);

        // A late completion must not resurrect the task.
        let mut outputs = Args::new();
        outputs.insert("result".to_string(), json!(4));
        task.handle(completion(&task, outputs));
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(task.outputs().is_empty());
    }

    #[test]
    fn failure_populates_error() {
        let task = detached();
        task.handle(Response::Failure {
            task: task.uuid().to_string(),
            error: Some("division by zero".to_string()),
        });
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error().as_deref(), Some("division by zero"));
    }

    #[test]
    fn crash_settles_exactly_once() {
        let task = detached();
        let crashes = Arc::new(AtomicUsize::new(0));
        let seen = crashes.clone();
        task.listen(move |event| {
            if event.response_type == ResponseType::Crash {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        task.crash("worker process terminated unexpectedly");
        task.crash("worker process terminated unexpectedly");
        assert_eq!(task.status(), TaskStatus::Crashed);
        assert_eq!(crashes.load(Ordering::SeqCst), 1);
        assert!(task.error().is_some());
    }

    #[test]
    fn listeners_fire_in_order_and_survive_panics() {
        let task = detached();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        task.listen(move |_| o.lock().push("first")).unwrap();
        task.listen(|_| panic!("listener bug")).unwrap();
        let o = order.clone();
        task.listen(move |_| o.lock().push("third")).unwrap();

        task.handle(Response::Launch {
            task: task.uuid().to_string(),
        });
        assert_eq!(*order.lock(), vec!["first", "third"]);
    }

    #[test]
    fn listen_after_start_rejected() {
        let task = detached();
        task.handle(Response::Launch {
            task: task.uuid().to_string(),
        });
        let err = task.listen(|_| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cancel_before_start_never_runs() {
        let task = detached();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let k = kinds.clone();
        task.listen(move |event| k.lock().push(event.response_type))
            .unwrap();

        task.cancel().await.unwrap();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(*kinds.lock(), vec![ResponseType::Cancelation]);

        // wait_for on an already-settled task returns immediately.
        let status = task.wait_for(Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(status, TaskStatus::Canceled);

        // And start() is now an invalid-state error.
        let err = task.start().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cancel_terminal_task_is_noop() {
        let task = detached();
        task.handle(Response::Cancelation {
            task: task.uuid().to_string(),
        });
        task.cancel().await.unwrap();
        assert_eq!(task.status(), TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn wait_for_resolves_after_background_settlement() {
        // The task settles while nobody is waiting; a later wait_for must
        // still see the terminal state instead of blocking.
        let task = detached();
        task.handle(Response::Launch {
            task: task.uuid().to_string(),
        });
        let mut outputs = Args::new();
        outputs.insert("result".to_string(), json!(4));
        task.handle(completion(&task, outputs));
        assert_eq!(task.status(), TaskStatus::Complete);

        let status = task
            .wait_for(Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn wait_for_timeout_leaves_state_untouched() {
        let task = detached();
        task.handle(Response::Launch {
            task: task.uuid().to_string(),
        });
        let err = task
            .wait_for(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(task.status(), TaskStatus::Running);
    }
}
