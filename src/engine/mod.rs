//! Boundary to the external relay engine: its process and its stats api.
//!
//! The supervisor only talks to [`EngineLauncher`] and [`EngineInstance`], so it can be
//! driven by a fake engine in tests.

use std::{future::Future, path::Path, pin::Pin, time::Duration};

pub mod process;
pub mod proto;
pub mod stats;
#[cfg(test)]
pub(crate) mod testing;

pub use process::{XrayLauncher, XrayLauncherOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Another process already holds one of the listen ports.
    PortConflict { detail: String },
    ExecutableMissing { program: String },
    /// The engine's own dry run refused the document.
    ConfigRejected { detail: String },
    ReadinessTimeout { after: Duration },
    ExitedEarly { code: Option<i32>, detail: String },
    Io { detail: String },
    /// A newer apply replaced this one before it ran.
    Superseded,
    /// The caller stopped waiting; the lifecycle operation itself keeps going.
    WaitTimeout { after: Duration },
    SupervisorGone,
}

impl LifecycleError {
    /// Fatal errors are reported and not retried. A start that never became ready counts:
    /// the launcher's readiness signal does not depend on engine settings.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PortConflict { .. }
                | Self::ExecutableMissing { .. }
                | Self::ConfigRejected { .. }
                | Self::ReadinessTimeout { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PortConflict { .. } => "port_conflict",
            Self::ExecutableMissing { .. } => "executable_missing",
            Self::ConfigRejected { .. } => "config_rejected",
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::ExitedEarly { .. } => "exited_early",
            Self::Io { .. } => "io",
            Self::Superseded => "superseded",
            Self::WaitTimeout { .. } => "wait_timeout",
            Self::SupervisorGone => "supervisor_gone",
        }
    }
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PortConflict { detail } => write!(f, "listen port already in use: {detail}"),
            Self::ExecutableMissing { program } => {
                write!(f, "engine executable not found: {program}")
            }
            Self::ConfigRejected { detail } => write!(f, "engine rejected config: {detail}"),
            Self::ReadinessTimeout { after } => {
                write!(f, "engine not ready after {}ms", after.as_millis())
            }
            Self::ExitedEarly { code, detail } => match code {
                Some(code) => write!(f, "engine exited with code {code}: {detail}"),
                None => write!(f, "engine terminated by signal: {detail}"),
            },
            Self::Io { detail } => write!(f, "engine io error: {detail}"),
            Self::Superseded => write!(f, "superseded by a newer config"),
            Self::WaitTimeout { after } => write!(
                f,
                "gave up waiting for the engine after {}ms",
                after.as_millis()
            ),
            Self::SupervisorGone => write!(f, "engine supervisor is not running"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<std::io::Error> for LifecycleError {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            detail: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub detail: String,
}

pub type CheckFuture = Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send>>;
pub type LaunchFuture =
    Pin<Box<dyn Future<Output = Result<Box<dyn EngineInstance>, LifecycleError>> + Send>>;
pub type InstanceFuture<'a> = Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>>;
pub type StopFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
pub type ExitFuture<'a> = Pin<Box<dyn Future<Output = ExitReport> + Send + 'a>>;

pub trait EngineLauncher: Send + Sync {
    /// Dry-runs the document at `config_path` without touching a running engine.
    fn check(&self, config_path: &Path) -> CheckFuture;
    fn launch(&self, config_path: &Path) -> LaunchFuture;
    /// Whether a running instance can pick up a rewritten document without a restart.
    fn supports_reload(&self) -> bool;
    fn name(&self) -> &'static str;
}

pub trait EngineInstance: Send {
    /// Unique per launched process; stats baselines are keyed by it.
    fn instance_id(&self) -> &str;
    fn wait_ready(&mut self, timeout: Duration) -> InstanceFuture<'_>;
    fn reload(&mut self) -> InstanceFuture<'_>;
    fn stop(&mut self, grace: Duration) -> StopFuture<'_>;
    /// Resolves once the process is gone. Must be cancel-safe.
    fn wait_exit(&mut self) -> ExitFuture<'_>;
}
