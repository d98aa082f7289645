use std::{collections::HashMap, sync::Arc, time::Duration};

use loadout_model::{AppAction, AppId, ManagedApp, Outcome};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    process_controller::{KILL_CONFIRM_WINDOW, ProcessController, ProcessHandle, StopOutcome},
    report::{SharedReport, app_component},
    settings::Tuning,
};

const STOP_SLACK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Start,
    Stop,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Stop => "stop",
        }
    }
}

/// Processes this session started, by app.
#[derive(Debug, Default)]
pub struct StartedApps {
    handles: HashMap<AppId, ProcessHandle>,
}

impl StartedApps {
    pub fn handle(&self, id: &AppId) -> Option<&ProcessHandle> {
        self.handles.get(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Starts and stops the companion apps around a game session.
///
/// Both sequences always run to completion; individual failures end up in the
/// report and never abort the sequence.
#[derive(Clone, Debug)]
pub struct AppCoordinator {
    controller: ProcessController,
    workers: usize,
    action_timeout: Duration,
    graceful_stop: Duration,
}

impl AppCoordinator {
    pub fn new(controller: ProcessController, tuning: &Tuning) -> Self {
        Self {
            controller,
            workers: tuning.app_workers.max(1),
            action_timeout: tuning.app_action_timeout,
            graceful_stop: tuning.graceful_stop,
        }
    }

    pub async fn run_startup_sequence(&self, apps: &[Arc<ManagedApp>], report: &SharedReport) -> StartedApps {
        let results = self.run_phase(Phase::Start, apps, HashMap::new(), report).await;
        StartedApps { handles: results }
    }

    /// Runs every app's end action, including apps whose start failed or was
    /// skipped.
    pub async fn run_shutdown_sequence(
        &self,
        apps: &[Arc<ManagedApp>],
        started: StartedApps,
        report: &SharedReport,
    ) {
        let _ = self.run_phase(Phase::Stop, apps, started.handles, report).await;
    }

    async fn run_phase(
        &self,
        phase: Phase,
        apps: &[Arc<ManagedApp>],
        mut started: HashMap<AppId, ProcessHandle>,
        report: &SharedReport,
    ) -> HashMap<AppId, ProcessHandle> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();

        for app in apps {
            let action = match phase {
                Phase::Start => app.start_action,
                Phase::Stop => app.end_action,
            };
            if action == AppAction::None {
                continue;
            }

            let app = app.clone();
            let known = started.remove(&app.id);
            let permits = permits.clone();
            let report = report.clone();
            let this = self.clone();
            set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (app.id.clone(), None);
                };
                let component = app_component(&app.id);
                let limit = this.item_timeout(action);
                let (outcome, detail, handle) =
                    match tokio::time::timeout(limit, this.run_action(&app, action, known)).await {
                        Ok(v) => v,
                        Err(_) => (
                            Outcome::Failed,
                            format!("{} timed out after {limit:?}", action.as_str()),
                            None,
                        ),
                    };
                report.record(component, phase.as_str(), outcome, Some(detail)).await;
                (app.id.clone(), handle)
            });
        }

        let mut handles = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Some(handle))) => {
                    handles.insert(id, handle);
                }
                Ok((_, None)) => {}
                Err(e) => tracing::warn!(phase = phase.as_str(), error = %e, "app action task failed"),
            }
        }
        handles
    }

    /// A stop always gets long enough to escalate to a kill.
    fn item_timeout(&self, action: AppAction) -> Duration {
        match action {
            AppAction::StopProcess => self
                .action_timeout
                .max(self.graceful_stop + KILL_CONFIRM_WINDOW + STOP_SLACK),
            _ => self.action_timeout,
        }
    }

    async fn run_action(
        &self,
        app: &ManagedApp,
        action: AppAction,
        known: Option<ProcessHandle>,
    ) -> (Outcome, String, Option<ProcessHandle>) {
        match action {
            AppAction::None => (Outcome::Skipped, "no action".to_string(), None),
            AppAction::StartProcess => self.start(app),
            AppAction::StopProcess => self.stop(app, known).await,
            AppAction::TogglePersistentState => {
                let (outcome, detail, _) = self.spawn_executable(app);
                (outcome, detail, None)
            }
        }
    }

    fn start(&self, app: &ManagedApp) -> (Outcome, String, Option<ProcessHandle>) {
        if let Some(name) = app.match_name()
            && let Some(running) = self.controller.find_running(&name)
        {
            return (
                Outcome::Skipped,
                format!("already running (pid {})", running.pid()),
                None,
            );
        }
        self.spawn_executable(app)
    }

    fn spawn_executable(&self, app: &ManagedApp) -> (Outcome, String, Option<ProcessHandle>) {
        let Some(exe) = app.executable.as_deref() else {
            return (Outcome::Failed, "no executable configured".to_string(), None);
        };
        match self.controller.start_process(exe, &app.args, None) {
            Ok(h) => (Outcome::Succeeded, format!("pid {}", h.pid()), Some(h)),
            Err(e) => (Outcome::Failed, e.to_string(), None),
        }
    }

    async fn stop(&self, app: &ManagedApp, known: Option<ProcessHandle>) -> (Outcome, String, Option<ProcessHandle>) {
        let target = match known.filter(|h| !h.has_exited()) {
            Some(h) => Some(h),
            None => app.match_name().and_then(|name| self.controller.find_running(&name)),
        };
        let Some(handle) = target else {
            return (Outcome::Succeeded, StopOutcome::AlreadyGone.as_str().to_string(), None);
        };

        let stopped = self.controller.request_stop(&handle, self.graceful_stop).await;
        tracing::debug!(app = %app.id, pid = handle.pid(), outcome = stopped.as_str(), "app stop finished");
        (Outcome::Succeeded, stopped.as_str().to_string(), None)
    }
}
