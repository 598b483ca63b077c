//! Scriptable in-memory engine for supervisor and pipeline tests.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::oneshot, time::Instant};

use crate::engine::{
    CheckFuture, EngineInstance, EngineLauncher, ExitFuture, ExitReport, InstanceFuture,
    LaunchFuture, LifecycleError, StopFuture,
};

#[derive(Default)]
pub(crate) struct Script {
    pub(crate) events: Vec<String>,
    pub(crate) check_results: VecDeque<Result<(), LifecycleError>>,
    pub(crate) launch_results: VecDeque<Result<(), LifecycleError>>,
    pub(crate) ready_results: VecDeque<Result<(), LifecycleError>>,
    pub(crate) reload_results: VecDeque<Result<(), LifecycleError>>,
    /// Instances exit right after becoming ready.
    pub(crate) crash_after_ready: bool,
    pub(crate) crash_triggers: Vec<oneshot::Sender<ExitReport>>,
    pub(crate) launched_at: Vec<Instant>,
}

#[derive(Clone)]
pub(crate) struct FakeLauncher {
    pub(crate) script: Arc<Mutex<Script>>,
    reload: bool,
}

impl FakeLauncher {
    pub(crate) fn new(reload: bool) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            reload,
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.script.lock().unwrap().events.clone()
    }

    pub(crate) fn crash_latest(&self, code: i32) {
        let trigger = self.script.lock().unwrap().crash_triggers.pop();
        if let Some(trigger) = trigger {
            let _ = trigger.send(ExitReport {
                code: Some(code),
                detail: "segfault".to_string(),
            });
        }
    }
}

impl EngineLauncher for FakeLauncher {
    fn check(&self, config_path: &Path) -> CheckFuture {
        let body = std::fs::read_to_string(config_path).unwrap_or_default();
        let mut script = self.script.lock().unwrap();
        script.events.push(format!("check:{body}"));
        let result = script.check_results.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn launch(&self, config_path: &Path) -> LaunchFuture {
        let body = std::fs::read_to_string(config_path).unwrap_or_default();
        let mut script = self.script.lock().unwrap();
        script.events.push(format!("launch:{body}"));
        script.launched_at.push(Instant::now());
        let result = script.launch_results.pop_front().unwrap_or(Ok(()));
        let ready = script.ready_results.pop_front().unwrap_or(Ok(()));
        let (tx, rx) = oneshot::channel();
        if script.crash_after_ready {
            let _ = tx.send(ExitReport {
                code: Some(1),
                detail: "crashed".to_string(),
            });
        } else {
            script.crash_triggers.push(tx);
        }
        let n = script.launched_at.len();
        let instance = FakeInstance {
            id: format!("instance-{n}"),
            ready,
            exit: rx,
            script: self.script.clone(),
        };
        Box::pin(async move {
            result.map(|()| Box::new(instance) as Box<dyn EngineInstance>)
        })
    }

    fn supports_reload(&self) -> bool {
        self.reload
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

struct FakeInstance {
    id: String,
    ready: Result<(), LifecycleError>,
    exit: oneshot::Receiver<ExitReport>,
    script: Arc<Mutex<Script>>,
}

impl EngineInstance for FakeInstance {
    fn instance_id(&self) -> &str {
        &self.id
    }

    fn wait_ready(&mut self, _timeout: Duration) -> InstanceFuture<'_> {
        let ready = self.ready.clone();
        Box::pin(async move { ready })
    }

    fn reload(&mut self) -> InstanceFuture<'_> {
        let mut script = self.script.lock().unwrap();
        script.events.push(format!("reload:{}", self.id));
        let result = script.reload_results.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn stop(&mut self, _grace: Duration) -> StopFuture<'_> {
        self.script
            .lock()
            .unwrap()
            .events
            .push(format!("stop:{}", self.id));
        Box::pin(async {})
    }

    fn wait_exit(&mut self) -> ExitFuture<'_> {
        Box::pin(async move {
            match (&mut self.exit).await {
                Ok(report) => report,
                Err(_) => std::future::pending().await,
            }
        })
    }
}
