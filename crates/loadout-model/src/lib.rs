use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Stable game identifier from the configuration catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub String);

impl std::fmt::Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the game process gets started and how its end is detected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchPlatform {
    /// Start the configured executable and wait for it.
    #[default]
    Direct,
    /// Ask a storefront client to start the game, then find it by process name.
    Storefront { store: String },
    /// The end of the session is confirmed by the user.
    ManualExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationFlags {
    pub recording: bool,
    pub avatar: bool,
    pub presence: bool,
    pub mixer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameDescriptor {
    pub id: GameId,
    pub display_name: String,
    /// Executable name or glob pattern (`*`, `?`) of the running game.
    pub process_name: String,
    #[serde(default)]
    pub platform: LaunchPlatform,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Storefront-side identifier (e.g. a Steam app id).
    #[serde(default)]
    pub store_id: Option<String>,
    #[serde(default)]
    pub apps: Vec<AppId>,
    #[serde(default)]
    pub integrations: IntegrationFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppAction {
    StartProcess,
    StopProcess,
    TogglePersistentState,
    #[default]
    None,
}

impl AppAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AppAction::StartProcess => "start_process",
            AppAction::StopProcess => "stop_process",
            AppAction::TogglePersistentState => "toggle_persistent_state",
            AppAction::None => "none",
        }
    }
}

/// A companion application started or stopped around the game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedApp {
    pub id: AppId,
    pub display_name: String,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default)]
    pub start_action: AppAction,
    #[serde(default)]
    pub end_action: AppAction,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ManagedApp {
    /// Name used to look the app up among running processes.
    ///
    /// Falls back to the executable's file name when no explicit name is set.
    pub fn match_name(&self) -> Option<String> {
        if let Some(name) = self.process_name.as_deref().map(str::trim)
            && !name.is_empty()
        {
            return Some(name.to_string());
        }
        self.executable
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingBehavior {
    /// Keep a replay buffer running for the length of the session.
    pub replay_buffer: bool,
    /// Save the replay buffer to disk before stopping it.
    pub save_replay_on_exit: bool,
    /// Record the whole session.
    pub record: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarBehavior {
    pub start_hotkey: Option<String>,
    pub end_hotkey: Option<String>,
    pub model_id: Option<String>,
}

/// Connection and behavior parameters of one remotely controlled tool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationDescriptor<B> {
    pub enabled: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Password or token; empty when the tool needs none.
    pub credential: String,
    /// Process name used for the cheap "is the tool running" check.
    pub process_name: Option<String>,
    pub behavior: B,
}

impl<B> IntegrationDescriptor<B> {
    pub fn ws_url(&self) -> Option<String> {
        let host = self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        let port = self.port?;
        Some(format!("ws://{host}:{port}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceDescriptor {
    pub enabled: bool,
    /// Local pipe the presence helper listens on.
    pub pipe: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerDescriptor {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Integrations {
    pub recording: IntegrationDescriptor<RecordingBehavior>,
    pub avatar: IntegrationDescriptor<AvatarBehavior>,
    pub presence: PresenceDescriptor,
    pub mixer: MixerDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    StartingApps,
    ActivatingIntegrations,
    LaunchingGame,
    Monitoring,
    DeactivatingIntegrations,
    StoppingApps,
    Complete,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::StartingApps => "starting_apps",
            SessionState::ActivatingIntegrations => "activating_integrations",
            SessionState::LaunchingGame => "launching_game",
            SessionState::Monitoring => "monitoring",
            SessionState::DeactivatingIntegrations => "deactivating_integrations",
            SessionState::StoppingApps => "stopping_apps",
            SessionState::Complete => "complete",
            SessionState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
    /// Ends the session early (only the game launch).
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub component: String,
    pub action: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub game: GameId,
    pub final_state: SessionState,
    pub entries: Vec<ReportEntry>,
}

impl SessionReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.entries.iter().filter(|e| e.outcome == outcome).count()
    }

    pub fn find(&self, component: &str, action: &str) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .find(|e| e.component == component && e.action == action)
    }

    pub fn has_problems(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.outcome, Outcome::Failed | Outcome::Fatal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_non_empty() {
        let id = SessionId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn only_complete_and_aborted_are_terminal() {
        assert!(SessionState::Complete.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Monitoring.is_terminal());
        assert!(!SessionState::StoppingApps.is_terminal());
    }

    #[test]
    fn platform_defaults_to_direct() {
        let game: GameDescriptor = serde_json::from_value(serde_json::json!({
            "id": "hades",
            "display_name": "Hades",
            "process_name": "Hades.exe",
        }))
        .unwrap();
        assert_eq!(game.platform, LaunchPlatform::Direct);
        assert!(!game.integrations.recording);
    }

    #[test]
    fn storefront_platform_is_tagged() {
        let p: LaunchPlatform =
            serde_json::from_value(serde_json::json!({ "kind": "storefront", "store": "steam" }))
                .unwrap();
        assert_eq!(
            p,
            LaunchPlatform::Storefront {
                store: "steam".to_string()
            }
        );
    }

    #[test]
    fn match_name_prefers_process_name() {
        let mut app = ManagedApp {
            id: AppId("ahk".to_string()),
            display_name: "AutoHotkey".to_string(),
            executable: Some(PathBuf::from("/opt/tools/hotkeys")),
            process_name: Some("  ".to_string()),
            start_action: AppAction::StartProcess,
            end_action: AppAction::StopProcess,
            args: Vec::new(),
        };
        assert_eq!(app.match_name().as_deref(), Some("hotkeys"));

        app.process_name = Some("AutoHotkey.exe".to_string());
        assert_eq!(app.match_name().as_deref(), Some("AutoHotkey.exe"));
    }

    #[test]
    fn ws_url_requires_host_and_port() {
        let mut d = IntegrationDescriptor::<RecordingBehavior>::default();
        assert_eq!(d.ws_url(), None);
        d.host = Some("127.0.0.1".to_string());
        assert_eq!(d.ws_url(), None);
        d.port = Some(4455);
        assert_eq!(d.ws_url().as_deref(), Some("ws://127.0.0.1:4455"));
    }

    #[test]
    fn report_helpers_count_and_find() {
        let entry = |component: &str, action: &str, outcome| ReportEntry {
            component: component.to_string(),
            action: action.to_string(),
            outcome,
            detail: None,
            at_unix_ms: 0,
        };
        let report = SessionReport {
            session_id: SessionId::new(),
            game: GameId("g".to_string()),
            final_state: SessionState::Complete,
            entries: vec![
                entry("app:a", "start", Outcome::Succeeded),
                entry("app:b", "start", Outcome::Failed),
                entry("integration:recording", "connect", Outcome::Skipped),
            ],
        };
        assert_eq!(report.count(Outcome::Succeeded), 1);
        assert!(report.find("integration:recording", "connect").is_some());
        assert!(report.has_problems());
    }
}
