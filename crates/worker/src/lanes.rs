//! Execution lanes: where submitted scripts actually run.
//!
//! Jobs without a queue name share one serial lane, a single thread
//! draining a FIFO channel, so they run one at a time in submission
//! order. Jobs with a queue name each get their own thread and run
//! concurrently.
//!
//! Every job produces exactly one terminal response. A script that
//! panics is reported as a FAILURE with the error text `thread death`;
//! the lane thread itself survives.

use std::collections::HashMap;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;

use crate::context::TaskContext;
use crate::engine::{Outcome, ScriptEngine};
use tandem_core::{encode, Args, Response};

/// One unit of work: a script plus its inputs, identified by task uuid.
#[derive(Debug)]
pub struct Job {
    pub uuid: String,
    pub script: String,
    pub inputs: Args,
}

type CancelMap = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

pub struct Lanes {
    engine: Arc<dyn ScriptEngine>,
    responses: Sender<Response>,
    cancels: CancelMap,
    serial_tx: Option<Sender<Job>>,
    serial_handle: Option<JoinHandle<()>>,
    parallel: Vec<JoinHandle<()>>,
}

impl Lanes {
    pub fn new(engine: Arc<dyn ScriptEngine>, responses: Sender<Response>) -> Self {
        let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));
        let (serial_tx, serial_rx) = unbounded::<Job>();
        let serial_handle = {
            let engine = engine.clone();
            let responses = responses.clone();
            let cancels = cancels.clone();
            std::thread::spawn(move || {
                for job in serial_rx {
                    let cancel = cancel_flag(&cancels, &job.uuid);
                    run_job(&*engine, &responses, &cancels, job, cancel);
                }
            })
        };
        Self {
            engine,
            responses,
            cancels,
            serial_tx: Some(serial_tx),
            serial_handle: Some(serial_handle),
            parallel: Vec::new(),
        }
    }

    /// Route a job to its lane. `queue` of `None` means the shared serial
    /// lane; any name means a fresh concurrent thread.
    pub fn submit(&mut self, job: Job, queue: Option<String>) {
        // Register the cancel flag up front so CANCEL can reach a job
        // that is still waiting in the serial lane.
        self.cancels
            .lock()
            .insert(job.uuid.clone(), Arc::new(AtomicBool::new(false)));

        match queue {
            None => {
                if let Some(tx) = &self.serial_tx {
                    // The serial thread outlives every sender; send cannot fail.
                    let _ = tx.send(job);
                }
            }
            Some(name) => {
                tracing::debug!(task = %job.uuid, queue = %name, "starting concurrent lane");
                let engine = self.engine.clone();
                let responses = self.responses.clone();
                let cancels = self.cancels.clone();
                self.parallel.push(std::thread::spawn(move || {
                    let cancel = cancel_flag(&cancels, &job.uuid);
                    run_job(&*engine, &responses, &cancels, job, cancel);
                }));
            }
        }
    }

    /// Flag a job for cancellation. Returns false if the uuid is unknown,
    /// which includes jobs that already reached a terminal response.
    pub fn cancel(&self, uuid: &str) -> bool {
        match self.cancels.lock().get(uuid) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Stop accepting jobs and wait for every lane to drain.
    pub fn shutdown(mut self) {
        self.serial_tx.take();
        if let Some(handle) = self.serial_handle.take() {
            let _ = handle.join();
        }
        for handle in self.parallel.drain(..) {
            let _ = handle.join();
        }
    }
}

fn cancel_flag(cancels: &CancelMap, uuid: &str) -> Arc<AtomicBool> {
    cancels
        .lock()
        .get(uuid)
        .cloned()
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)))
}

fn run_job(
    engine: &dyn ScriptEngine,
    responses: &Sender<Response>,
    cancels: &CancelMap,
    job: Job,
    cancel: Arc<AtomicBool>,
) {
    let _ = responses.send(Response::Launch {
        task: job.uuid.clone(),
    });

    let ctx = TaskContext::new(job.uuid.clone(), cancel, responses.clone());
    let run = catch_unwind(AssertUnwindSafe(|| {
        engine.run(&job.script, &job.inputs, &ctx)
    }));

    let terminal = match run {
        Ok(Ok(Outcome::Complete(result))) => {
            let mut outputs = ctx.take_outputs();
            match result {
                // An object result contributes each entry as an output.
                Some(Value::Object(map)) => outputs.extend(map),
                Some(Value::Null) | None => {}
                Some(value) => {
                    outputs.insert("result".to_string(), value);
                }
            }
            Response::Completion {
                task: job.uuid.clone(),
                outputs,
            }
        }
        Ok(Ok(Outcome::Canceled)) => Response::Cancelation {
            task: job.uuid.clone(),
        },
        Ok(Err(error)) => Response::Failure {
            task: job.uuid.clone(),
            error: Some(error.to_string()),
        },
        Err(_) => Response::Failure {
            task: job.uuid.clone(),
            error: Some("thread death".to_string()),
        },
    };

    cancels.lock().remove(&job.uuid);
    let _ = responses.send(terminal);
}

/// Single writer for the response stream. All lanes funnel responses
/// through one channel so lines never interleave on the wire.
pub fn spawn_writer(rx: Receiver<Response>, mut out: impl Write + Send + 'static) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for response in rx {
            let line = match encode(&response) {
                Ok(line) => line,
                Err(error) => {
                    tracing::warn!(%error, "dropping unencodable response");
                    continue;
                }
            };
            if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
                // The peer is gone; nothing more to write.
                return;
            }
        }
    })
}
