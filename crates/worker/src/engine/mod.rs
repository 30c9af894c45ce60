//! The script engine seam.
//!
//! A worker binary can host any number of script flavors; each flavor
//! implements [`ScriptEngine`] and is selected with `--flavor` on the
//! command line. The built-in `expr` flavor is a small expression
//! language suitable for smoke tests and simple numeric jobs.

use std::sync::Arc;

use serde_json::Value;

use crate::context::TaskContext;
use tandem_core::Args;

mod expr;

pub use expr::ExprEngine;

/// Error raised by a script while it runs. The text ends up verbatim in
/// the FAILURE response, so engines should make it readable.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ScriptError(pub String);

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// How a script run ended when it did not fail.
#[derive(Debug)]
pub enum Outcome {
    /// The script ran to completion, possibly producing a result value.
    Complete(Option<Value>),
    /// The script observed its cancel flag and stopped early.
    Canceled,
}

/// A script flavor: parses and runs scripts on the caller's thread.
///
/// Implementations must be cancel-aware: long-running work should poll
/// [`TaskContext::cancelled`] and return [`Outcome::Canceled`] promptly.
pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, script: &str, inputs: &Args, ctx: &TaskContext) -> Result<Outcome, ScriptError>;
}

/// Look up the engine for a flavor name.
pub fn engine_for(flavor: &str) -> Option<Arc<dyn ScriptEngine>> {
    match flavor {
        "expr" => Some(Arc::new(ExprEngine)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expr_flavor_registered() {
        let engine = engine_for("expr").unwrap();
        assert_eq!(engine.name(), "expr");
    }

    #[test]
    fn unknown_flavor_rejected() {
        assert!(engine_for("lua").is_none());
    }
}
