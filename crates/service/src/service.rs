//! Service: worker process lifecycle and the response dispatch loop.
//!
//! One `Service` owns one worker process. Three background loops run on
//! the tokio runtime: the dispatch loop (sole reader of the worker's
//! stdout and sole mutator of task state), the stderr loop (forwards
//! worker logs to the debug callback), and the monitor loop (reaps the
//! process and crashes whatever tasks it left behind).

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};

use tandem_core::{decode, encode, Args, Error, Request, Response, Result};

use crate::task::Task;

/// Consecutive undecodable lines tolerated before the inbound stream is
/// treated as poisoned and the service shuts down.
const MAX_PROTOCOL_ERRORS: usize = 8;

/// How long `close()` waits for the worker to exit after EOF before
/// force-killing it, and again after the kill signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static SERVICE_COUNT: AtomicU64 = AtomicU64::new(0);

type DebugFn = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) struct ServiceInner {
    id: u64,
    pid: Option<u32>,
    tasks: DashMap<String, Task>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    closed: AtomicBool,
    crashed: AtomicBool,
    debug: parking_lot::Mutex<Option<DebugFn>>,
    kill: mpsc::Sender<()>,
    exited: watch::Sender<bool>,
    exit_status: parking_lot::Mutex<Option<ExitStatus>>,
}

impl ServiceInner {
    pub(crate) async fn send(&self, request: &Request) -> Result<()> {
        let line = encode(request)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::invalid_state("open service", "closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        drop(guard);
        self.debug_service(&line);
        Ok(())
    }

    pub(crate) fn forget(&self, uuid: &str) {
        self.tasks.remove(uuid);
    }

    fn debug_service(&self, message: &str) {
        self.debug_emit("SERVICE", message);
    }

    fn debug_worker(&self, message: &str) {
        self.debug_emit("WORKER", message);
    }

    fn debug_emit(&self, prefix: &str, message: &str) {
        if let Some(callback) = self.debug.lock().as_ref() {
            callback(&format!("[{prefix}-{}] {message}", self.id));
        }
    }

    /// Drive every non-terminal task to Crashed and refuse new work.
    fn crash_all(&self, message: &str) {
        // Graceful close also reaps through here; only an unexpected
        // termination marks the service crashed.
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.crashed.store(true, Ordering::SeqCst);
        }
        let leftover: Vec<Task> = self.tasks.iter().map(|e| e.value().clone()).collect();
        self.tasks.clear();
        if !leftover.is_empty() {
            self.debug_service(&format!(
                "<worker terminated with {} pending tasks>",
                leftover.len()
            ));
        }
        for task in leftover {
            task.crash(message);
        }
    }
}

/// Access to a linked worker running in a different process. Tasks created
/// through the service run asynchronously in the worker, which streams
/// updates back over the process pipes.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Spawn a worker process with piped stdio and wire up the background
    /// loops. Must be called within a tokio runtime.
    pub fn spawn(program: &Path, args: &[String], cwd: &Path) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn {
                command: program.display().to_string(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exited_tx, _) = watch::channel(false);

        let inner = Arc::new(ServiceInner {
            id: SERVICE_COUNT.fetch_add(1, Ordering::SeqCst),
            pid: child.id(),
            tasks: DashMap::new(),
            stdin: tokio::sync::Mutex::new(stdin),
            closed: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            debug: parking_lot::Mutex::new(None),
            kill: kill_tx,
            exited: exited_tx,
            exit_status: parking_lot::Mutex::new(None),
        });

        if let Some(stdout) = stdout {
            tokio::spawn(dispatch_loop(inner.clone(), stdout));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(stderr_loop(inner.clone(), stderr));
        }
        tokio::spawn(monitor_loop(inner.clone(), child, kill_rx));

        Ok(Self { inner })
    }

    /// Create a task on the worker's default serial lane.
    pub fn task(&self, script: &str, inputs: Args) -> Result<Task> {
        self.task_on(script, inputs, None)
    }

    /// Create a task on a named parallel lane.
    pub fn task_on(&self, script: &str, inputs: Args, queue: Option<&str>) -> Result<Task> {
        if self.inner.crashed.load(Ordering::SeqCst) {
            return Err(Error::WorkerCrash {
                message: "worker process terminated unexpectedly".to_string(),
            });
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state("open service", "closed"));
        }
        let task = Task::new(Arc::downgrade(&self.inner), script, inputs, queue);
        self.inner.tasks.insert(task.uuid().to_string(), task.clone());
        Ok(task)
    }

    /// Register a callback receiving every protocol line and lifecycle
    /// note, prefixed `[SERVICE-n]` or `[WORKER-n]`.
    pub fn debug(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.debug.lock() = Some(Box::new(callback));
    }

    /// True once the service refuses new tasks (closed or crashed).
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// OS process id of the worker, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Exit code of the worker process, once it has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        (*self.inner.exit_status.lock()).and_then(|s| s.code())
    }

    /// Shut the worker down. Idempotent: closes the worker's stdin (EOF is
    /// the graceful shutdown request), waits a bounded grace interval, then
    /// force-kills. Outstanding non-terminal tasks end Crashed.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.stdin.lock().await.take();

        let mut rx = self.inner.exited.subscribe();
        let graceful = tokio::time::timeout(SHUTDOWN_GRACE, rx.wait_for(|e| *e)).await;
        if graceful.is_err() {
            self.inner.debug_service("<worker unresponsive, killing>");
            let _ = self.inner.kill.send(()).await;
            let mut rx = self.inner.exited.subscribe();
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, rx.wait_for(|e| *e)).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("tasks", &self.inner.tasks.len())
            .field("closed", &self.closed())
            .finish()
    }
}

/// Read decoded responses one at a time and route each to the addressed
/// task. Listeners therefore always run on this loop, strictly before the
/// next response is processed.
async fn dispatch_loop(inner: Arc<ServiceInner>, stdout: tokio::process::ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    let mut consecutive_errors = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                inner.debug_service("<worker stdout closed>");
                break;
            }
            Err(e) => {
                inner.debug_service(&format!("<worker stdout error: {e}>"));
                break;
            }
        };
        inner.debug_service(&line);

        let response: Response = match decode(&line) {
            Ok(response) => {
                consecutive_errors = 0;
                response
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(service = inner.id, "{e}");
                inner.debug_service(&format!("<INVALID> {line}"));
                if consecutive_errors >= MAX_PROTOCOL_ERRORS {
                    inner.debug_service("<too many protocol errors, giving up>");
                    inner.crash_all("worker response stream is unreadable");
                    break;
                }
                continue;
            }
        };

        match response.task_id() {
            None => {
                // CRASH: fatal worker-level failure, broadcast to all tasks.
                let message = match &response {
                    Response::Crash { error } => error
                        .clone()
                        .unwrap_or_else(|| "worker process crashed".to_string()),
                    _ => "worker process crashed".to_string(),
                };
                inner.crash_all(&message);
                break;
            }
            Some(uuid) => {
                // Clone the handle out of the map before dispatching, so a
                // terminal transition can remove itself from the registry.
                let task = inner.tasks.get(uuid).map(|entry| entry.value().clone());
                match task {
                    Some(task) => task.handle(response),
                    None => inner.debug_service(&format!("No such task: {uuid}")),
                }
            }
        }
    }
}

async fn stderr_loop(inner: Arc<ServiceInner>, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        inner.debug_worker(&line);
    }
    inner.debug_service("<worker stderr closed>");
}

/// Wait for the worker process to terminate, then crash any tasks it left
/// behind. A message on the kill channel escalates to SIGKILL.
async fn monitor_loop(inner: Arc<ServiceInner>, mut child: Child, mut kill_rx: mpsc::Receiver<()>) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = kill_rx.recv() => {
                let _ = child.start_kill();
            }
        }
    };

    match status {
        Ok(status) => {
            if !status.success() {
                inner.debug_service(&format!(
                    "<worker process terminated with exit code {:?}>",
                    status.code()
                ));
            }
            *inner.exit_status.lock() = Some(status);
        }
        Err(e) => inner.debug_service(&format!("<failed to reap worker: {e}>")),
    }

    inner.crash_all("worker process terminated unexpectedly");
    // send_replace stores the value even with no receiver subscribed yet,
    // so a close() issued after the worker already exited returns at once.
    inner.exited.send_replace(true);
}
