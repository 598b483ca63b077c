use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    engine::{
        CheckFuture, EngineInstance, EngineLauncher, ExitFuture, ExitReport, InstanceFuture,
        LaunchFuture, LifecycleError, StopFuture,
    },
    id::new_ulid_string,
};

const OUTPUT_TAIL_LINES: usize = 20;
const LINE_CHANNEL_CAPACITY: usize = 256;
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(500);
const PORT_CONFLICT_MARKER: &str = "address already in use";
/// An engine still alive this long after SIGHUP took the reload.
const RELOAD_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct XrayLauncherOptions {
    pub bin: PathBuf,
    /// Substring of an engine log line that means listeners are up.
    pub ready_marker: String,
    /// Send SIGHUP for in-place reloads instead of restarting. Stock xray has no SIGHUP
    /// handler and dies on it, so this needs a binary or wrapper that reloads on the signal.
    pub reload_signal: bool,
    pub check_timeout: Duration,
}

impl XrayLauncherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bin: config.engine_bin.clone(),
            ready_marker: config.engine_ready_marker.clone(),
            reload_signal: config.engine_reload_signal,
            check_timeout: Duration::from_secs(config.readiness_timeout_secs),
        }
    }
}

/// Runs `xray run -c <path>` as a child process.
#[derive(Debug, Clone)]
pub struct XrayLauncher {
    opts: XrayLauncherOptions,
}

impl XrayLauncher {
    pub fn new(opts: XrayLauncherOptions) -> Self {
        Self { opts }
    }
}

impl EngineLauncher for XrayLauncher {
    fn check(&self, config_path: &Path) -> CheckFuture {
        let bin = self.opts.bin.clone();
        let path = config_path.to_path_buf();
        let timeout = self.opts.check_timeout;
        Box::pin(async move { run_config_test(&bin, &path, timeout).await })
    }

    fn launch(&self, config_path: &Path) -> LaunchFuture {
        let opts = self.opts.clone();
        let path = config_path.to_path_buf();
        Box::pin(async move {
            let instance = XrayInstance::spawn(&opts, &path)?;
            Ok(Box::new(instance) as Box<dyn EngineInstance>)
        })
    }

    fn supports_reload(&self) -> bool {
        self.opts.reload_signal
    }

    fn name(&self) -> &'static str {
        "xray"
    }
}

async fn run_config_test(bin: &Path, path: &Path, timeout: Duration) -> Result<(), LifecycleError> {
    let mut cmd = Command::new(bin);
    cmd.args(["run", "-test", "-c"]).arg(path);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(LifecycleError::ExecutableMissing {
                program: bin.display().to_string(),
            });
        }
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(LifecycleError::ReadinessTimeout { after: timeout }),
    };

    if output.status.success() {
        return Ok(());
    }

    let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .map(str::to_string)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let keep_from = lines.len().saturating_sub(5);
    let detail = lines.split_off(keep_from).join(" | ");
    Err(LifecycleError::ConfigRejected { detail })
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

struct XrayInstance {
    instance_id: String,
    child: Child,
    lines: mpsc::Receiver<String>,
    tail: OutputTail,
    ready_marker: String,
    exited: Option<ExitReport>,
}

impl XrayInstance {
    fn spawn(opts: &XrayLauncherOptions, path: &Path) -> Result<Self, LifecycleError> {
        let mut cmd = Command::new(&opts.bin);
        cmd.args(["run", "-c"]).arg(path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                LifecycleError::ExecutableMissing {
                    program: opts.bin.display().to_string(),
                }
            } else {
                err.into()
            }
        })?;

        let instance_id = new_ulid_string();
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let tail: OutputTail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone(), tail.clone(), instance_id.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx, tail.clone(), instance_id.clone());
        }

        info!(
            instance_id,
            pid = child.id().unwrap_or_default(),
            bin = %opts.bin.display(),
            "engine process spawned"
        );

        Ok(Self {
            instance_id,
            child,
            lines: rx,
            tail,
            ready_marker: opts.ready_marker.clone(),
            exited: None,
        })
    }

    fn tail_detail(&self) -> String {
        match self.tail.lock() {
            Ok(tail) => tail
                .iter()
                .rev()
                .take(5)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join(" | "),
            Err(_) => String::new(),
        }
    }

    fn saw_port_conflict(&self) -> bool {
        self.tail
            .lock()
            .map(|tail| tail.iter().any(|l| l.contains(PORT_CONFLICT_MARKER)))
            .unwrap_or(false)
    }

    async fn record_exit(&mut self, status: std::io::Result<std::process::ExitStatus>) -> ExitReport {
        // Let the readers flush what the process wrote before it died.
        let _ = tokio::time::timeout(DRAIN_AFTER_EXIT, async {
            while self.lines.recv().await.is_some() {}
        })
        .await;

        let report = match status {
            Ok(status) => ExitReport {
                code: status.code(),
                detail: self.tail_detail(),
            },
            Err(err) => ExitReport {
                code: None,
                detail: format!("wait failed: {err}"),
            },
        };
        self.exited = Some(report.clone());
        report
    }

    fn classify_early_exit(&self, report: ExitReport) -> LifecycleError {
        if self.saw_port_conflict() {
            LifecycleError::PortConflict {
                detail: report.detail,
            }
        } else {
            LifecycleError::ExitedEarly {
                code: report.code,
                detail: report.detail,
            }
        }
    }
}

impl EngineInstance for XrayInstance {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn wait_ready(&mut self, timeout: Duration) -> InstanceFuture<'_> {
        Box::pin(async move {
            if let Some(report) = self.exited.clone() {
                return Err(self.classify_early_exit(report));
            }

            let deadline = Instant::now() + timeout;
            loop {
                tokio::select! {
                    line = self.lines.recv() => match line {
                        Some(line) if line.contains(PORT_CONFLICT_MARKER) => {
                            return Err(LifecycleError::PortConflict { detail: line });
                        }
                        Some(line) if line.contains(&self.ready_marker) => return Ok(()),
                        Some(_) => {}
                        None => {
                            let status = self.child.wait().await;
                            let report = self.record_exit(status).await;
                            return Err(self.classify_early_exit(report));
                        }
                    },
                    status = self.child.wait() => {
                        let report = self.record_exit(status).await;
                        return Err(self.classify_early_exit(report));
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(LifecycleError::ReadinessTimeout { after: timeout });
                    }
                }
            }
        })
    }

    fn reload(&mut self) -> InstanceFuture<'_> {
        Box::pin(async move {
            let Some(pid) = self.child.id() else {
                return Err(LifecycleError::ExitedEarly {
                    code: None,
                    detail: "process already exited".to_string(),
                });
            };
            send_signal(pid, libc::SIGHUP)?;
            debug!(instance_id = self.instance_id, pid, "sent reload signal");

            match tokio::time::timeout(RELOAD_SETTLE, self.child.wait()).await {
                Err(_) => Ok(()),
                Ok(status) => {
                    let report = self.record_exit(status).await;
                    warn!(
                        instance_id = self.instance_id,
                        code = ?report.code,
                        "engine exited on the reload signal"
                    );
                    Err(LifecycleError::ExitedEarly {
                        code: report.code,
                        detail: format!("exited on reload signal: {}", report.detail),
                    })
                }
            }
        })
    }

    fn stop(&mut self, grace: Duration) -> StopFuture<'_> {
        Box::pin(async move {
            if self.exited.is_some() {
                return;
            }
            if let Some(pid) = self.child.id()
                && let Err(err) = send_signal(pid, libc::SIGTERM)
            {
                warn!(instance_id = self.instance_id, pid, %err, "SIGTERM failed");
            }

            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    self.record_exit(status).await;
                }
                Err(_) => {
                    warn!(
                        instance_id = self.instance_id,
                        grace_ms = grace.as_millis() as u64,
                        "engine ignored SIGTERM; killing"
                    );
                    let _ = self.child.kill().await;
                    let status = self.child.wait().await;
                    self.record_exit(status).await;
                }
            }
        })
    }

    fn wait_exit(&mut self) -> ExitFuture<'_> {
        Box::pin(async move {
            if let Some(report) = self.exited.clone() {
                return report;
            }
            let status = self.child.wait().await;
            self.record_exit(status).await
        })
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>, tail: OutputTail, instance_id: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(instance_id, "engine: {line}");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
            }
            // Nobody drains the channel once the engine is ready; drop instead of blocking.
            let _ = tx.try_send(line);
        }
    });
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), LifecycleError> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}
