//! The tandem worker binary.
//!
//! Reads one JSON request per line from stdin, executes scripts on the
//! execution lanes, and writes one JSON response per line to stdout.
//! Diagnostics go to stderr only; stdout belongs to the protocol.
//!
//! A blank line or EOF on stdin is the shutdown signal: pending jobs
//! drain, then the process exits 0. A read failure on stdin is not
//! recoverable; the worker reports a CRASH and exits 1.

use std::io::BufRead;

use tandem_core::{decode, Request, Response};
use tandem_worker::{engine_for, spawn_writer, Job, Lanes};

const DEFAULT_FLAVOR: &str = "expr";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let flavor = match parse_flavor(std::env::args().skip(1)) {
        Ok(flavor) => flavor,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };
    let Some(engine) = engine_for(&flavor) else {
        eprintln!("unknown script flavor: {flavor}");
        std::process::exit(2);
    };
    tracing::debug!(flavor = engine.name(), "worker ready");

    let (responses, response_rx) = crossbeam::channel::unbounded();
    let writer = spawn_writer(response_rx, std::io::stdout());
    let mut lanes = Lanes::new(engine, responses.clone());

    let mut code = 0;
    for line in std::io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                // stdin is broken; nothing sensible can arrive anymore.
                let _ = responses.send(Response::Crash {
                    error: Some(format!("failed to read request stream: {error}")),
                });
                code = 1;
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            // Shutdown sentinel.
            break;
        }
        match decode::<Request>(line) {
            Ok(Request::Execute {
                task,
                script,
                inputs,
                queue,
            }) => {
                lanes.submit(
                    Job {
                        uuid: task,
                        script,
                        inputs,
                    },
                    queue,
                );
            }
            Ok(Request::Cancel { task }) => {
                if !lanes.cancel(&task) {
                    tracing::debug!(%task, "cancel for unknown task ignored");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "ignoring malformed request line");
            }
        }
    }

    // Drain running jobs, then let the writer flush their responses.
    lanes.shutdown();
    drop(responses);
    let _ = writer.join();
    std::process::exit(code);
}

fn parse_flavor(args: impl Iterator<Item = String>) -> Result<String, String> {
    let mut flavor = DEFAULT_FLAVOR.to_string();
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        if arg == "--flavor" {
            flavor = args
                .next()
                .ok_or_else(|| "--flavor requires a value".to_string())?;
        } else if let Some(value) = arg.strip_prefix("--flavor=") {
            flavor = value.to_string();
        } else {
            return Err(format!("unrecognized argument: {arg}"));
        }
    }
    Ok(flavor)
}
