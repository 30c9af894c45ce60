//! Environment handles: where worker executables live and how to launch
//! them.
//!
//! Provisioning an environment (building interpreters, installing
//! dependencies) is somebody else's job; this layer only resolves an
//! already-provisioned launch spec and hands it to [`Service::spawn`].

use std::path::{Path, PathBuf};

use tandem_core::{Error, Result};

use crate::service::Service;

/// Name of the bundled worker executable.
pub const WORKER_EXE: &str = "tandem-worker";

/// Environment variable overriding where the worker executable is found.
/// Useful when embedding tandem in a build that relocates binaries.
pub const WORKER_EXE_ENV: &str = "TANDEM_WORKER";

/// An already-provisioned environment: a base directory that may contain
/// worker executables, plus whether the system PATH may be consulted.
#[derive(Debug, Clone)]
pub struct Environment {
    base: PathBuf,
    use_system_path: bool,
}

impl Environment {
    /// Environment rooted at a specific directory; the system PATH is not
    /// consulted.
    pub fn base(dir: impl Into<PathBuf>) -> Self {
        Self {
            base: dir.into(),
            use_system_path: false,
        }
    }

    /// Environment that resolves executables on the system PATH, rooted at
    /// the current directory.
    pub fn system() -> Self {
        Self {
            base: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            use_system_path: true,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Launch the bundled tandem worker with the default script flavor.
    pub fn worker(&self) -> Result<Service> {
        self.worker_with_flavor(None)
    }

    /// Launch the bundled tandem worker with an explicit script flavor.
    pub fn worker_with_flavor(&self, flavor: Option<&str>) -> Result<Service> {
        let mut args = Vec::new();
        if let Some(flavor) = flavor {
            args.push("--flavor".to_string());
            args.push(flavor.to_string());
        }
        if let Ok(exe) = std::env::var(WORKER_EXE_ENV) {
            return Service::spawn(Path::new(&exe), &args, &self.base);
        }
        self.service(&[WORKER_EXE], &args)
    }

    /// Resolve the first usable executable among `exes` and spawn it as a
    /// worker process with `args`, cwd at the environment base.
    pub fn service(&self, exes: &[&str], args: &[String]) -> Result<Service> {
        let program = self.resolve(exes)?;
        Service::spawn(&program, args, &self.base)
    }

    fn resolve(&self, exes: &[&str]) -> Result<PathBuf> {
        for exe in exes {
            let candidate = self.base.join(exe);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
            if self.use_system_path {
                if let Ok(found) = which::which(exe) {
                    return Ok(found);
                }
            }
        }
        Err(Error::Spawn {
            command: exes.join(", "),
            message: format!("No executables found amongst candidates: {exes:?}"),
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
