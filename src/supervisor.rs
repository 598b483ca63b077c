use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::{SeedableRng, rngs::StdRng};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    backoff::{Backoff, BackoffPolicy},
    compiler::EngineDocument,
    config::Config,
    engine::{EngineInstance, EngineLauncher, ExitReport, LifecycleError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Reloading,
    Crashed,
    /// Restart budget exhausted; only an explicit start or apply re-arms it.
    Failed,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reloading => "reloading",
            Self::Crashed => "crashed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub instance_id: Option<String>,
    pub consecutive_failures: u32,
    pub last_error: Option<LifecycleError>,
    pub changed_at: DateTime<Utc>,
}

impl EngineStatus {
    fn stopped() -> Self {
        Self {
            state: EngineState::Stopped,
            instance_id: None,
            consecutive_failures: 0,
            last_error: None,
            changed_at: Utc::now(),
        }
    }

    /// Id of the instance the stats api currently belongs to.
    pub fn running_instance(&self) -> Option<&str> {
        match self.state {
            EngineState::Running => self.instance_id.as_deref(),
            _ => None,
        }
    }
}

pub type BeforeStopFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Runs against an instance that is about to be stopped, while its stats api still
/// answers. Instances that crashed never get this call.
pub trait BeforeStop: Send + Sync + std::fmt::Debug {
    fn before_stop<'a>(&'a self, instance_id: &'a str) -> BeforeStopFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub config_path: PathBuf,
    pub readiness_timeout: Duration,
    pub stop_grace: Duration,
    pub max_restarts: u32,
    pub backoff: BackoffPolicy,
    /// An instance that stays up this long clears the consecutive failure count.
    pub stable_after: Duration,
    pub before_stop: Option<Arc<dyn BeforeStop>>,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            config_path: config.engine_config_path(),
            readiness_timeout: Duration::from_secs(config.readiness_timeout_secs),
            stop_grace: Duration::from_secs(5),
            max_restarts: config.max_restarts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(config.restart_backoff_base_ms),
                Duration::from_secs(config.restart_backoff_cap_secs),
            ),
            stable_after: Duration::from_secs(config.stable_after_secs),
            before_stop: None,
        }
    }

    /// How long a caller waits for its request: a stop, a start and a rollback start.
    fn wait_budget(&self) -> Duration {
        self.stop_grace + self.readiness_timeout * 2 + Duration::from_secs(5)
    }
}

#[derive(Debug, Clone)]
struct Desired {
    generation: u64,
    document: Option<Arc<EngineDocument>>,
    run: bool,
}

#[derive(Debug, Clone)]
struct Outcome {
    generation: u64,
    result: Result<(), LifecycleError>,
}

/// Cheap to clone; every clone talks to the same supervisor task.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    desired: Arc<watch::Sender<Desired>>,
    outcomes: watch::Receiver<Outcome>,
    status: watch::Receiver<EngineStatus>,
    wait_budget: Duration,
}

impl SupervisorHandle {
    /// Makes `document` the running configuration. Requests that arrive while another
    /// is in flight collapse into the newest one; the older callers get `Superseded`.
    pub async fn apply(&self, document: EngineDocument) -> Result<(), LifecycleError> {
        let document = Arc::new(document);
        self.submit(move |d| {
            d.document = Some(document);
            d.run = true;
        })
        .await
    }

    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.submit(|d| d.run = true).await
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.submit(|d| d.run = false).await
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    async fn submit(&self, edit: impl FnOnce(&mut Desired)) -> Result<(), LifecycleError> {
        let mut outcomes = self.outcomes.clone();
        let mut generation = 0;
        self.desired.send_modify(|d| {
            d.generation += 1;
            edit(d);
            generation = d.generation;
        });

        let wait = async {
            loop {
                {
                    let outcome = outcomes.borrow_and_update();
                    if outcome.generation == generation {
                        return outcome.result.clone();
                    }
                    if outcome.generation > generation {
                        return Err(LifecycleError::Superseded);
                    }
                }
                if outcomes.changed().await.is_err() {
                    return Err(LifecycleError::SupervisorGone);
                }
            }
        };

        match tokio::time::timeout(self.wait_budget, wait).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::WaitTimeout {
                after: self.wait_budget,
            }),
        }
    }
}

pub fn spawn_supervisor(
    config: &Config,
    launcher: Arc<dyn EngineLauncher>,
    before_stop: Arc<dyn BeforeStop>,
) -> (SupervisorHandle, tokio::task::JoinHandle<()>) {
    let mut opts = SupervisorOptions::from_config(config);
    opts.before_stop = Some(before_stop);
    spawn_supervisor_with_options(opts, launcher)
}

pub fn spawn_supervisor_with_options(
    opts: SupervisorOptions,
    launcher: Arc<dyn EngineLauncher>,
) -> (SupervisorHandle, tokio::task::JoinHandle<()>) {
    let (desired_tx, desired_rx) = watch::channel(Desired {
        generation: 0,
        document: None,
        run: false,
    });
    let (outcome_tx, outcome_rx) = watch::channel(Outcome {
        generation: 0,
        result: Ok(()),
    });
    let (status_tx, status_rx) = watch::channel(EngineStatus::stopped());

    let handle = SupervisorHandle {
        desired: Arc::new(desired_tx),
        outcomes: outcome_rx,
        status: status_rx,
        wait_budget: opts.wait_budget(),
    };

    let backoff = Backoff::new(opts.backoff, StdRng::from_entropy());
    let actor = Supervisor {
        launcher,
        opts,
        desired: desired_rx,
        outcomes: outcome_tx,
        status: status_tx,
        instance: None,
        current: None,
        last_good: None,
        backoff,
        restart_at: None,
        stable_at: None,
    };
    let task = tokio::spawn(actor.run());

    (handle, task)
}

enum Event {
    Desired(Desired),
    Closed,
    Exited(ExitReport),
    RestartDue,
    Stable,
}

struct Supervisor {
    launcher: Arc<dyn EngineLauncher>,
    opts: SupervisorOptions,
    desired: watch::Receiver<Desired>,
    outcomes: watch::Sender<Outcome>,
    status: watch::Sender<EngineStatus>,
    instance: Option<Box<dyn EngineInstance>>,
    /// The document at `config_path`, which the live instance (if any) runs.
    current: Option<Arc<EngineDocument>>,
    /// Last document that reached `Running`.
    last_good: Option<Arc<EngineDocument>>,
    backoff: Backoff<StdRng>,
    restart_at: Option<Instant>,
    stable_at: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let event = self.next_event().await;
            match event {
                Event::Desired(desired) => {
                    let generation = desired.generation;
                    let result = self.converge(desired).await;
                    if let Err(err) = &result {
                        warn!(generation, kind = err.kind(), error = %err, "engine request failed");
                    }
                    self.outcomes.send_replace(Outcome { generation, result });
                }
                Event::Closed => {
                    self.stop_instance().await;
                    self.set_state(EngineState::Stopped, None);
                    break;
                }
                Event::Exited(report) => {
                    self.instance = None;
                    self.stable_at = None;
                    let err = LifecycleError::ExitedEarly {
                        code: report.code,
                        detail: report.detail,
                    };
                    warn!(error = %err, "engine exited unexpectedly");
                    self.set_state(EngineState::Crashed, Some(err));
                    self.schedule_restart();
                }
                Event::RestartDue => {
                    self.restart_at = None;
                    self.restart_current().await;
                }
                Event::Stable => {
                    self.stable_at = None;
                    if self.backoff.attempts() > 0 {
                        debug!(
                            failures = self.backoff.attempts(),
                            "engine stable; clearing failure count"
                        );
                    }
                    self.backoff.reset();
                    self.status.send_modify(|s| s.consecutive_failures = 0);
                }
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        let restart_at = self.restart_at;
        let stable_at = self.stable_at;
        let desired = &mut self.desired;
        let instance = &mut self.instance;

        let exited = async {
            match instance.as_mut() {
                Some(instance) => instance.wait_exit().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = desired.changed() => match changed {
                Ok(()) => Event::Desired(desired.borrow_and_update().clone()),
                Err(_) => Event::Closed,
            },
            report = exited => Event::Exited(report),
            _ = sleep_until_opt(restart_at), if restart_at.is_some() => Event::RestartDue,
            _ = sleep_until_opt(stable_at), if stable_at.is_some() => Event::Stable,
        }
    }

    async fn converge(&mut self, desired: Desired) -> Result<(), LifecycleError> {
        self.restart_at = None;
        if self.status.borrow().state == EngineState::Failed {
            self.backoff.reset();
            self.status.send_modify(|s| s.consecutive_failures = 0);
        }

        if !desired.run {
            self.stop_instance().await;
            self.backoff.reset();
            self.set_state(EngineState::Stopped, None);
            return Ok(());
        }

        let Some(document) = desired.document.or_else(|| self.current.clone()) else {
            return Err(LifecycleError::Io {
                detail: "no engine document has been applied yet".to_string(),
            });
        };

        let unchanged = self
            .current
            .as_ref()
            .is_some_and(|current| current.as_bytes() == document.as_bytes());
        if unchanged && self.instance.is_some() {
            return Ok(());
        }

        if !unchanged {
            self.stage(&document).await?;
        }

        let reloadable = self.instance.is_some()
            && self.launcher.supports_reload()
            && self
                .current
                .as_ref()
                .is_some_and(|current| current.shape_fingerprint() == document.shape_fingerprint());
        self.current = Some(document.clone());

        if reloadable && let Some(instance) = self.instance.as_mut() {
            self.status.send_modify(|s| {
                s.state = EngineState::Reloading;
                s.changed_at = Utc::now();
            });
            match instance.reload().await {
                Ok(()) => {
                    info!(
                        instance_id = instance.instance_id(),
                        "engine reloaded in place"
                    );
                    self.last_good = Some(document);
                    self.set_state(EngineState::Running, None);
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "engine reload failed; restarting instead");
                }
            }
        }

        self.stop_instance().await;
        match self.start_current().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.roll_back(&document).await;
                Err(err)
            }
        }
    }

    /// Writes `document` next to the live config, lets the engine dry-run it, then renames
    /// it into place. A rejected document never reaches `config_path`.
    async fn stage(&mut self, document: &EngineDocument) -> Result<(), LifecycleError> {
        let path = self.opts.config_path.clone();
        let tmp = tmp_path(&path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, document.as_bytes()).await?;

        if let Err(err) = self.launcher.check(&tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            self.status.send_modify(|s| s.last_error = Some(err.clone()));
            return Err(err);
        }

        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), bytes = document.as_bytes().len(), "engine config staged");
        Ok(())
    }

    async fn roll_back(&mut self, failed: &EngineDocument) {
        let Some(last_good) = self.last_good.clone() else {
            self.after_start_failure();
            return;
        };
        if last_good.as_bytes() == failed.as_bytes() {
            self.after_start_failure();
            return;
        }

        warn!("new engine config failed to start; restoring the last good one");
        if let Err(err) = write_atomic(&self.opts.config_path, last_good.as_bytes()).await {
            warn!(error = %err, "failed to restore last good engine config");
            self.after_start_failure();
            return;
        }
        self.current = Some(last_good);
        if self.start_current().await.is_err() {
            self.after_start_failure();
        }
    }

    async fn restart_current(&mut self) {
        if self.current.is_none() {
            return;
        }
        self.status.send_modify(|s| s.consecutive_failures = self.backoff.attempts());
        if self.start_current().await.is_err() {
            self.after_start_failure();
        }
    }

    /// Launches the document at `config_path` and waits for readiness.
    async fn start_current(&mut self) -> Result<(), LifecycleError> {
        self.set_state(EngineState::Starting, None);
        let mut instance = match self.launcher.launch(&self.opts.config_path).await {
            Ok(instance) => instance,
            Err(err) => {
                self.set_state(EngineState::Crashed, Some(err.clone()));
                return Err(err);
            }
        };

        if let Err(err) = instance.wait_ready(self.opts.readiness_timeout).await {
            instance.stop(self.opts.stop_grace).await;
            self.set_state(EngineState::Crashed, Some(err.clone()));
            return Err(err);
        }

        let instance_id = instance.instance_id().to_string();
        info!(
            engine = self.launcher.name(),
            instance_id, "engine running"
        );
        self.instance = Some(instance);
        self.last_good = self.current.clone();
        self.stable_at = Some(Instant::now() + self.opts.stable_after);
        self.status.send_modify(|s| {
            s.state = EngineState::Running;
            s.instance_id = Some(instance_id);
            s.last_error = None;
            s.changed_at = Utc::now();
        });
        Ok(())
    }

    /// Called with the state already `Crashed`. Fatal errors stay there; others retry.
    fn after_start_failure(&mut self) {
        let fatal = self
            .status
            .borrow()
            .last_error
            .as_ref()
            .is_some_and(LifecycleError::is_fatal);
        if fatal {
            warn!("engine start failed with a fatal error; not retrying");
            return;
        }
        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        if self.backoff.attempts() >= self.opts.max_restarts {
            let failures = self.backoff.attempts();
            warn!(failures, "engine keeps failing; giving up until the next start");
            self.status.send_modify(|s| {
                s.state = EngineState::Failed;
                s.consecutive_failures = failures;
                s.changed_at = Utc::now();
            });
            return;
        }
        let delay = self.backoff.next_delay();
        let failures = self.backoff.attempts();
        info!(
            failures,
            delay_ms = delay.as_millis() as u64,
            "engine restart scheduled"
        );
        self.status.send_modify(|s| s.consecutive_failures = failures);
        self.restart_at = Some(Instant::now() + delay);
    }

    async fn stop_instance(&mut self) {
        self.stable_at = None;
        if let Some(mut instance) = self.instance.take() {
            if let Some(hook) = &self.opts.before_stop {
                hook.before_stop(instance.instance_id()).await;
            }
            debug!(instance_id = instance.instance_id(), "stopping engine");
            instance.stop(self.opts.stop_grace).await;
        }
    }

    fn set_state(&self, state: EngineState, error: Option<LifecycleError>) {
        self.status.send_modify(|s| {
            s.state = state;
            if state != EngineState::Running {
                s.instance_id = None;
            }
            if error.is_some() || state == EngineState::Running || state == EngineState::Stopped {
                s.last_error = error;
            }
            s.changed_at = Utc::now();
        });
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
