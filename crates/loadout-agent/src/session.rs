//! One game session: companions up, tools connected, game launched and
//! watched, then everything torn down again in reverse.

use std::{sync::Arc, time::Duration};

use loadout_model::{
    GameDescriptor, GameId, LaunchPlatform, ManagedApp, Outcome, SessionId, SessionReport, SessionState,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::Instrument;

use crate::{
    app_coordinator::AppCoordinator,
    config::Catalog,
    integration_coordinator::IntegrationCoordinator,
    process_controller::{ExitCode, ProcessController, ProcessHandle},
    report::{GAME, SharedReport},
    settings::Tuning,
    storefront::{StorefrontLauncher, SystemStorefront},
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown game `{0}`")]
    GameNotFound(String),
    /// The game did not start; teardown already ran and `report` is final.
    #[error("game launch failed: {detail}")]
    GameLaunch {
        detail: String,
        report: Box<SessionReport>,
    },
    #[error("session task failed: {0}")]
    Internal(String),
}

/// Starts sessions for games in a catalog.
pub struct SessionOrchestrator {
    catalog: Arc<Catalog>,
    tuning: Tuning,
    controller: ProcessController,
    storefront: Arc<dyn StorefrontLauncher>,
}

impl SessionOrchestrator {
    pub fn new(catalog: Arc<Catalog>, tuning: Tuning) -> Self {
        Self {
            catalog,
            tuning,
            controller: ProcessController::new(),
            storefront: Arc::new(SystemStorefront::from_env()),
        }
    }

    pub fn with_storefront(mut self, storefront: Arc<dyn StorefrontLauncher>) -> Self {
        self.storefront = storefront;
        self
    }

    /// Accepts the launch and returns at once; the session runs on its own
    /// task. Must be called from within a tokio runtime.
    pub fn launch(&self, game_id: &str) -> Result<SessionHandle, SessionError> {
        let game = self
            .catalog
            .game(game_id)
            .ok_or_else(|| SessionError::GameNotFound(game_id.to_string()))?;
        let apps = self.catalog.apps_for(&game);

        let id = SessionId::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let session = Session {
            id: id.clone(),
            game: game.clone(),
            apps,
            report: SharedReport::new(),
            state: state_tx,
            cancel: cancel_rx,
            controller: self.controller.clone(),
            apps_coordinator: AppCoordinator::new(self.controller.clone(), &self.tuning),
            integrations: IntegrationCoordinator::new(
                self.catalog.integrations(),
                self.controller.clone(),
                &self.tuning,
            ),
            storefront: self.storefront.clone(),
            discovery_timeout: self.tuning.game_discovery_timeout,
        };

        let span = tracing::info_span!("session", game = %game.id, session = %id.0);
        let task = tokio::spawn(session.run().instrument(span));

        Ok(SessionHandle {
            id,
            game: game.id.clone(),
            state: state_rx,
            cancel: SessionCanceller(Arc::new(cancel_tx)),
            task,
        })
    }
}

/// Cloneable cancellation trigger for one session.
#[derive(Clone, Debug)]
pub struct SessionCanceller(Arc<watch::Sender<bool>>);

impl SessionCanceller {
    /// Ends monitoring early. The game is never killed.
    pub fn cancel(&self) {
        if !self.0.send_replace(true) {
            tracing::info!("session cancellation requested");
        }
    }
}

pub struct SessionHandle {
    id: SessionId,
    game: GameId,
    state: watch::Receiver<SessionState>,
    cancel: SessionCanceller,
    task: JoinHandle<Result<SessionReport, SessionError>>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn game(&self) -> &GameId {
        &self.game
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> SessionCanceller {
        self.cancel.clone()
    }

    /// Waits for the terminal state.
    pub async fn wait(self) -> Result<SessionReport, SessionError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::Internal(e.to_string())),
        }
    }
}

enum Launch {
    Running(Option<ProcessHandle>),
    Cancelled,
    Failed(String),
}

struct Session {
    id: SessionId,
    game: Arc<GameDescriptor>,
    apps: Vec<Arc<ManagedApp>>,
    report: SharedReport,
    state: watch::Sender<SessionState>,
    cancel: watch::Receiver<bool>,
    controller: ProcessController,
    apps_coordinator: AppCoordinator,
    integrations: IntegrationCoordinator,
    storefront: Arc<dyn StorefrontLauncher>,
    discovery_timeout: Duration,
}

impl Session {
    fn transition(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        tracing::info!(from = prev.as_str(), state = next.as_str(), "session state changed");
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested; never, if it cannot be anymore.
    async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    async fn run(self) -> Result<SessionReport, SessionError> {
        self.transition(SessionState::StartingApps);
        let started = self
            .apps_coordinator
            .run_startup_sequence(&self.apps, &self.report)
            .await;

        self.transition(SessionState::ActivatingIntegrations);
        let mut active = self.integrations.activate(&self.game, &self.report).await;
        self.integrations.run_pre_actions(&mut active, &self.report).await;

        let launch = if self.is_cancelled() {
            Launch::Cancelled
        } else {
            self.transition(SessionState::LaunchingGame);
            self.launch_game().await
        };

        let failure = match launch {
            Launch::Running(handle) => {
                self.transition(SessionState::Monitoring);
                self.monitor(handle).await;
                None
            }
            Launch::Cancelled => {
                self.report
                    .record(
                        GAME,
                        "launch",
                        Outcome::Skipped,
                        Some("cancelled before the game started".to_string()),
                    )
                    .await;
                None
            }
            Launch::Failed(detail) => {
                self.report
                    .record(GAME, "launch", Outcome::Fatal, Some(detail.clone()))
                    .await;
                Some(detail)
            }
        };
        let aborted = failure.is_some();

        // Teardown runs no matter what happened above.
        self.transition(SessionState::DeactivatingIntegrations);
        self.integrations
            .run_post_actions(&mut active, &self.report, aborted)
            .await;
        self.integrations.deactivate(&mut active).await;

        self.transition(SessionState::StoppingApps);
        self.apps_coordinator
            .run_shutdown_sequence(&self.apps, started, &self.report)
            .await;

        let final_state = if aborted {
            SessionState::Aborted
        } else {
            SessionState::Complete
        };
        let report = self
            .report
            .finish(self.id.clone(), self.game.id.clone(), final_state)
            .await;
        self.transition(final_state);

        match failure {
            Some(detail) => Err(SessionError::GameLaunch {
                detail,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }

    async fn launch_game(&self) -> Launch {
        let game = &self.game;
        match &game.platform {
            LaunchPlatform::Direct | LaunchPlatform::ManualExit => {
                let Some(exe) = game.executable.as_deref() else {
                    return Launch::Failed("no executable configured".to_string());
                };
                match self
                    .controller
                    .start_process(exe, &game.args, game.working_dir.as_deref())
                {
                    Ok(h) => {
                        self.report
                            .record(GAME, "launch", Outcome::Succeeded, Some(format!("pid {}", h.pid())))
                            .await;
                        Launch::Running(Some(h))
                    }
                    Err(e) => Launch::Failed(e.to_string()),
                }
            }
            LaunchPlatform::Storefront { store } => {
                let store_id = game.store_id.as_deref().unwrap_or_default();
                if let Err(e) = self.storefront.launch(store, store_id) {
                    return Launch::Failed(e.to_string());
                }

                let found = tokio::select! {
                    found = self.controller.wait_for_process(&game.process_name, self.discovery_timeout) => found,
                    _ = self.cancelled() => return Launch::Cancelled,
                };
                match found {
                    Some(h) => {
                        self.report
                            .record(
                                GAME,
                                "launch",
                                Outcome::Succeeded,
                                Some(format!("found {} (pid {})", h.name(), h.pid())),
                            )
                            .await;
                        Launch::Running(Some(h))
                    }
                    None => Launch::Failed(format!(
                        "`{}` did not appear within {:?} of the {store} launch",
                        game.process_name, self.discovery_timeout
                    )),
                }
            }
        }
    }

    async fn monitor(&self, handle: Option<ProcessHandle>) {
        let manual = matches!(self.game.platform, LaunchPlatform::ManualExit);
        let watched = handle.filter(|_| !manual);

        let Some(handle) = watched else {
            self.cancelled().await;
            self.report
                .record(GAME, "monitor", Outcome::Succeeded, Some("ended by user".to_string()))
                .await;
            return;
        };

        let mut exit = tokio::spawn(wait_game_exit(
            self.controller.clone(),
            handle,
            self.game.process_name.clone(),
        ));
        tokio::select! {
            joined = &mut exit => {
                let (outcome, detail) = monitor_outcome(joined);
                self.report.record(GAME, "monitor", outcome, Some(detail)).await;
            }
            _ = self.cancelled() => {
                exit.abort();
                self.report
                    .record(
                        GAME,
                        "monitor",
                        Outcome::Skipped,
                        Some("cancelled; the game was left running".to_string()),
                    )
                    .await;
            }
        }
    }
}

/// Waits for the game to exit, following it when the started process was
/// only a launcher that handed off to another process with the same name.
async fn wait_game_exit(controller: ProcessController, handle: ProcessHandle, pattern: String) -> ExitCode {
    let mut current = handle;
    loop {
        let code = controller.wait_for_exit(&current).await;
        match controller.find_running(&pattern) {
            Some(next) if next.pid() != current.pid() => {
                tracing::debug!(from = current.pid(), to = next.pid(), "game handed off to another process");
                current = next;
            }
            _ => return code,
        }
    }
}

fn monitor_outcome(joined: Result<ExitCode, tokio::task::JoinError>) -> (Outcome, String) {
    match joined {
        Ok(ExitCode(Some(code))) => (Outcome::Succeeded, format!("game exited with code {code}")),
        Ok(ExitCode(None)) => (Outcome::Succeeded, "game exited".to_string()),
        Err(e) => (Outcome::Failed, format!("exit watch failed: {e}")),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        path::PathBuf,
        sync::{Arc, Mutex},
    };

    use loadout_model::{
        AppAction, AppId, IntegrationDescriptor, IntegrationFlags, Integrations, RecordingBehavior,
    };

    use super::*;
    use crate::{
        process_controller::testing::{file_name, unique_sleeper},
        report::app_component,
        storefront::StorefrontError,
    };

    fn fast() -> Tuning {
        Tuning {
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(300),
            connect_retry_delay: Duration::from_millis(50),
            graceful_stop: Duration::from_secs(2),
            app_workers: 4,
            app_action_timeout: Duration::from_secs(5),
            game_discovery_timeout: Duration::from_secs(2),
        }
    }

    fn unique(tag: &str) -> String {
        format!("loadout-{tag}-{}", uuid::Uuid::new_v4().simple())
    }

    fn sleeper_app(id: &str, exe: PathBuf) -> ManagedApp {
        ManagedApp {
            id: AppId(id.to_string()),
            display_name: id.to_string(),
            process_name: Some(file_name(&exe)),
            executable: Some(exe),
            start_action: AppAction::StartProcess,
            end_action: AppAction::StopProcess,
            args: vec!["30".to_string()],
        }
    }

    fn shell_game(script: &str, apps: &[&ManagedApp]) -> GameDescriptor {
        GameDescriptor {
            id: GameId("game".to_string()),
            display_name: "Game".to_string(),
            process_name: unique("game"),
            platform: LaunchPlatform::Direct,
            executable: Some(PathBuf::from("sh")),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            store_id: None,
            apps: apps.iter().map(|a| a.id.clone()).collect(),
            integrations: IntegrationFlags::default(),
        }
    }

    fn orchestrator(games: Vec<GameDescriptor>, apps: Vec<ManagedApp>, integrations: Integrations) -> SessionOrchestrator {
        let catalog = Catalog::from_parts(games, apps, integrations).unwrap();
        SessionOrchestrator::new(Arc::new(catalog), fast())
    }

    #[tokio::test]
    async fn companions_and_unreachable_recorder_still_complete() {
        let (chat_exe, overlay_exe) = (unique_sleeper("chat"), unique_sleeper("overlay"));
        let chat = sleeper_app("chat", chat_exe.path());
        let overlay = sleeper_app("overlay", overlay_exe.path());
        let broken = sleeper_app("broken", PathBuf::from("/nonexistent/loadout/broken"));
        let mut game = shell_game("sleep 0.3", &[&chat, &overlay, &broken]);
        game.integrations.recording = true;

        let mut integrations = Integrations::default();
        integrations.recording = IntegrationDescriptor {
            enabled: true,
            host: Some("127.0.0.1".to_string()),
            port: Some(1),
            credential: String::new(),
            process_name: Some(unique("recorder")),
            behavior: RecordingBehavior {
                replay_buffer: true,
                ..RecordingBehavior::default()
            },
        };

        let orch = orchestrator(vec![game], vec![chat, overlay, broken], integrations);
        let report = orch.launch("game").unwrap().wait().await.unwrap();

        assert_eq!(report.final_state, SessionState::Complete);
        let starts: Vec<_> = report.entries.iter().filter(|e| e.action == "start").collect();
        assert_eq!(starts.iter().filter(|e| e.outcome == Outcome::Succeeded).count(), 2);
        assert_eq!(starts.iter().filter(|e| e.outcome == Outcome::Failed).count(), 1);
        assert_eq!(
            report.find("integration:recording", "connect").map(|e| e.outcome),
            Some(Outcome::Skipped)
        );
        assert_eq!(report.find(GAME, "launch").map(|e| e.outcome), Some(Outcome::Succeeded));
        assert_eq!(report.find(GAME, "monitor").map(|e| e.outcome), Some(Outcome::Succeeded));
        // No behavior commands against a skipped integration.
        assert!(report.find("integration:recording", "stop_replay_buffer").is_none());
    }

    #[tokio::test]
    async fn failed_game_launch_aborts_after_teardown() {
        let (chat_exe, overlay_exe) = (unique_sleeper("chat"), unique_sleeper("overlay"));
        let chat = sleeper_app("chat", chat_exe.path());
        let overlay = sleeper_app("overlay", overlay_exe.path());
        let mut game = shell_game("", &[&chat, &overlay]);
        game.executable = Some(PathBuf::from("/nonexistent/loadout/game"));

        let orch = orchestrator(vec![game], vec![chat, overlay], Integrations::default());
        let handle = orch.launch("game").unwrap();
        let states = handle.subscribe();

        let report = match handle.wait().await {
            Err(SessionError::GameLaunch { report, .. }) => report,
            other => panic!("expected a launch failure, got {other:?}"),
        };
        assert_eq!(report.final_state, SessionState::Aborted);
        assert_eq!(*states.borrow(), SessionState::Aborted);
        assert_eq!(report.find(GAME, "launch").map(|e| e.outcome), Some(Outcome::Fatal));
        for app in ["chat", "overlay"] {
            let component = app_component(&AppId(app.to_string()));
            let stop = report.find(&component, "stop").unwrap();
            assert_eq!(stop.outcome, Outcome::Succeeded, "{app}");
        }
        assert!(report.find(GAME, "monitor").is_none());
    }

    #[tokio::test]
    async fn cancelling_a_manual_exit_session_skips_waiting() {
        let mut game = shell_game("exit 0", &[]);
        game.platform = LaunchPlatform::ManualExit;

        let orch = orchestrator(vec![game], Vec::new(), Integrations::default());
        let handle = orch.launch("game").unwrap();
        let mut states = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == SessionState::Monitoring),
        )
        .await
        .unwrap()
        .unwrap();

        // The game process already exited, yet monitoring only ends on cancel.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.state(), SessionState::Monitoring);

        handle.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.final_state, SessionState::Complete);
        assert_eq!(
            report.find(GAME, "monitor").and_then(|e| e.detail.as_deref()),
            Some("ended by user")
        );
    }

    #[tokio::test]
    async fn cancel_leaves_a_running_game_alone() {
        let exe = unique_sleeper("game");
        let mut game = shell_game("", &[]);
        game.executable = Some(exe.path());
        game.args = vec!["30".to_string()];
        game.process_name = exe.name();

        let orch = orchestrator(vec![game], Vec::new(), Integrations::default());
        let handle = orch.launch("game").unwrap();
        let mut states = handle.subscribe();
        states
            .wait_for(|s| *s == SessionState::Monitoring)
            .await
            .unwrap();

        handle.canceller().cancel();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.find(GAME, "monitor").map(|e| e.outcome), Some(Outcome::Skipped));

        let pc = ProcessController::new();
        let still_running = pc.find_running(&exe.name()).unwrap();
        pc.request_stop(&still_running, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn cancel_before_launch_skips_the_game() {
        let exe = unique_sleeper("never");
        let chat_exe = unique_sleeper("chat");
        let app = sleeper_app("chat", chat_exe.path());
        let mut game = shell_game("", &[&app]);
        game.executable = Some(exe.path());

        let orch = orchestrator(vec![game], vec![app], Integrations::default());
        let handle = orch.launch("game").unwrap();
        handle.cancel();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.final_state, SessionState::Complete);
        // The companion may or may not have started; either way it was stopped.
        assert!(report.find("app:chat", "stop").is_some());
        let launch = report.find(GAME, "launch");
        if launch.map(|e| e.outcome) == Some(Outcome::Skipped) {
            assert!(ProcessController::new().find_running(&exe.name()).is_none());
        }
    }

    #[tokio::test]
    async fn panicked_exit_watch_is_a_failed_monitor() {
        let joined: Result<ExitCode, _> = tokio::spawn(async { panic!("watch task died") }).await;
        let (outcome, detail) = monitor_outcome(joined);
        assert_eq!(outcome, Outcome::Failed);
        assert!(detail.starts_with("exit watch failed"));

        assert_eq!(
            monitor_outcome(Ok(ExitCode(Some(0)))),
            (Outcome::Succeeded, "game exited with code 0".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_game_is_rejected_without_a_session() {
        let orch = orchestrator(Vec::new(), Vec::new(), Integrations::default());
        let err = orch.launch("nope").err().unwrap();
        assert!(matches!(err, SessionError::GameNotFound(ref id) if id == "nope"));
    }

    /// Starts a short-lived sleeper instead of talking to a real storefront.
    struct FakeStore {
        exe: Option<PathBuf>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl StorefrontLauncher for FakeStore {
        fn launch(&self, store: &str, store_id: &str) -> Result<(), StorefrontError> {
            self.calls
                .lock()
                .unwrap()
                .push((store.to_string(), store_id.to_string()));
            if let Some(exe) = &self.exe {
                ProcessController::new()
                    .start_process(exe, &["1".to_string()], None)
                    .unwrap();
            }
            Ok(())
        }
    }

    fn store_game(process_name: String) -> GameDescriptor {
        let mut game = shell_game("", &[]);
        game.platform = LaunchPlatform::Storefront {
            store: "steam".to_string(),
        };
        game.executable = None;
        game.store_id = Some("1245620".to_string());
        game.process_name = process_name;
        game
    }

    #[tokio::test]
    async fn storefront_game_is_found_by_name_and_watched() {
        let exe = unique_sleeper("store");
        let store = Arc::new(FakeStore {
            exe: Some(exe.path()),
            calls: Mutex::new(Vec::new()),
        });

        let orch = orchestrator(vec![store_game(exe.name())], Vec::new(), Integrations::default())
            .with_storefront(store.clone());
        let report = orch.launch("game").unwrap().wait().await.unwrap();

        assert_eq!(report.final_state, SessionState::Complete);
        assert_eq!(report.find(GAME, "monitor").map(|e| e.outcome), Some(Outcome::Succeeded));
        assert_eq!(
            *store.calls.lock().unwrap(),
            vec![("steam".to_string(), "1245620".to_string())]
        );
    }

    #[tokio::test]
    async fn storefront_game_that_never_appears_aborts() {
        let store = Arc::new(FakeStore {
            exe: None,
            calls: Mutex::new(Vec::new()),
        });
        let orch = orchestrator(vec![store_game(unique("ghost"))], Vec::new(), Integrations::default())
            .with_storefront(store);

        let err = orch.launch("game").unwrap().wait().await.unwrap_err();
        assert!(matches!(err, SessionError::GameLaunch { ref report, .. } if report.final_state == SessionState::Aborted));
    }
}
