//! Connects the external tools a game wants, drives their per-session
//! behavior, and disconnects them again.

use std::time::Duration;

use loadout_model::{
    AvatarBehavior, GameDescriptor, IntegrationDescriptor, Integrations, Outcome, PresenceDescriptor,
    RecordingBehavior,
};
use serde_json::Value;

use crate::{
    avatar::AvatarClient,
    control_channel::{ChannelError, ControlClient},
    presence::{PresenceBroadcaster, PresenceProvider, PresenceState},
    process_controller::ProcessController,
    recording::RecordingClient,
    report::{SharedReport, integration_component, now_unix_ms},
    settings::Tuning,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrationKind {
    Recording,
    Avatar,
    Presence,
    Mixer,
}

impl IntegrationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationKind::Recording => "recording",
            IntegrationKind::Avatar => "avatar",
            IntegrationKind::Presence => "presence",
            IntegrationKind::Mixer => "mixer",
        }
    }
}

/// Behavior commands issued against a connected tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntegrationAction {
    StartReplayBuffer,
    SaveReplayBuffer,
    StopReplayBuffer,
    StartRecording,
    StopRecording,
    LoadModel(String),
    TriggerHotkey(String),
}

impl IntegrationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationAction::StartReplayBuffer => "start_replay_buffer",
            IntegrationAction::SaveReplayBuffer => "save_replay_buffer",
            IntegrationAction::StopReplayBuffer => "stop_replay_buffer",
            IntegrationAction::StartRecording => "start_recording",
            IntegrationAction::StopRecording => "stop_recording",
            IntegrationAction::LoadModel(_) => "load_model",
            IntegrationAction::TriggerHotkey(_) => "trigger_hotkey",
        }
    }
}

/// One concrete tool client.
pub enum IntegrationClient {
    Recording(RecordingClient),
    Avatar(AvatarClient),
}

impl IntegrationClient {
    async fn perform(&self, action: &IntegrationAction, timeout: Duration) -> Result<(), ChannelError> {
        match (self, action) {
            (IntegrationClient::Recording(c), IntegrationAction::StartReplayBuffer) => {
                c.start_buffered_recording(timeout).await
            }
            (IntegrationClient::Recording(c), IntegrationAction::SaveReplayBuffer) => {
                c.save_buffered_recording(timeout).await
            }
            (IntegrationClient::Recording(c), IntegrationAction::StopReplayBuffer) => {
                c.stop_buffered_recording(timeout).await
            }
            (IntegrationClient::Recording(c), IntegrationAction::StartRecording) => c.start_recording(timeout).await,
            (IntegrationClient::Recording(c), IntegrationAction::StopRecording) => c.stop_recording(timeout).await,
            (IntegrationClient::Avatar(c), IntegrationAction::LoadModel(id)) => c.load_model(id, timeout).await,
            (IntegrationClient::Avatar(c), IntegrationAction::TriggerHotkey(id)) => {
                c.trigger_hotkey(id, timeout).await
            }
            (client, action) => Err(ChannelError::Protocol(format!(
                "{} does not support {}",
                client.name(),
                action.as_str()
            ))),
        }
    }
}

impl ControlClient for IntegrationClient {
    fn name(&self) -> &'static str {
        match self {
            IntegrationClient::Recording(c) => c.name(),
            IntegrationClient::Avatar(c) => c.name(),
        }
    }

    fn is_reachable(&self) -> bool {
        match self {
            IntegrationClient::Recording(c) => c.is_reachable(),
            IntegrationClient::Avatar(c) => c.is_reachable(),
        }
    }

    async fn connect(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        match self {
            IntegrationClient::Recording(c) => c.connect(timeout).await,
            IntegrationClient::Avatar(c) => c.connect(timeout).await,
        }
    }

    async fn send_command(&self, command: &str, args: Value, timeout: Duration) -> Result<Value, ChannelError> {
        match self {
            IntegrationClient::Recording(c) => c.send_command(command, args, timeout).await,
            IntegrationClient::Avatar(c) => c.send_command(command, args, timeout).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            IntegrationClient::Recording(c) => c.disconnect().await,
            IntegrationClient::Avatar(c) => c.disconnect().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            IntegrationClient::Recording(c) => c.is_connected(),
            IntegrationClient::Avatar(c) => c.is_connected(),
        }
    }
}

pub struct ActiveIntegration {
    pub kind: IntegrationKind,
    pub client: IntegrationClient,
    /// Set once the connection broke; the integration is not used again.
    pub failed: Option<String>,
}

/// Integrations connected for one session.
#[derive(Default)]
pub struct ActiveIntegrations {
    clients: Vec<ActiveIntegration>,
    presence: Option<PresenceBroadcaster>,
}

impl ActiveIntegrations {
    pub fn is_active(&self, kind: IntegrationKind) -> bool {
        self.clients.iter().any(|c| c.kind == kind && c.failed.is_none())
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.presence.is_none()
    }
}

/// Integration settings with globally disabled tools already removed.
pub struct IntegrationCoordinator {
    recording: Option<IntegrationDescriptor<RecordingBehavior>>,
    avatar: Option<IntegrationDescriptor<AvatarBehavior>>,
    presence: Option<PresenceDescriptor>,
    mixer_enabled: bool,
    controller: ProcessController,
    connect_timeout: Duration,
    command_timeout: Duration,
    retry_delay: Duration,
}

impl IntegrationCoordinator {
    pub fn new(integrations: &Integrations, controller: ProcessController, tuning: &Tuning) -> Self {
        Self {
            recording: Some(integrations.recording.clone()).filter(|d| d.enabled),
            avatar: Some(integrations.avatar.clone()).filter(|d| d.enabled),
            presence: Some(integrations.presence.clone()).filter(|d| d.enabled),
            mixer_enabled: integrations.mixer.enabled,
            controller,
            connect_timeout: tuning.connect_timeout,
            command_timeout: tuning.command_timeout,
            retry_delay: tuning.connect_retry_delay,
        }
    }

    /// Connects every integration the game enables. Unavailable tools are
    /// recorded as skipped; this never fails.
    pub async fn activate(&self, game: &GameDescriptor, report: &SharedReport) -> ActiveIntegrations {
        let flags = game.integrations;
        let mut active = ActiveIntegrations::default();

        let recording = async {
            let desc = self.recording.as_ref().filter(|_| flags.recording)?;
            let client = self.client_for(IntegrationKind::Recording, desc, report, |url| {
                IntegrationClient::Recording(RecordingClient::new(
                    url,
                    desc.credential.clone(),
                    desc.process_name.clone(),
                    self.controller.clone(),
                ))
            });
            self.connect(IntegrationKind::Recording, client.await?, report).await
        };
        let avatar = async {
            let desc = self.avatar.as_ref().filter(|_| flags.avatar)?;
            let client = self.client_for(IntegrationKind::Avatar, desc, report, |url| {
                IntegrationClient::Avatar(AvatarClient::new(
                    url,
                    desc.credential.clone(),
                    desc.process_name.clone(),
                    self.controller.clone(),
                ))
            });
            self.connect(IntegrationKind::Avatar, client.await?, report).await
        };
        let (recording, avatar) = tokio::join!(recording, avatar);
        active.clients.extend(recording);
        active.clients.extend(avatar);

        if flags.mixer && self.mixer_enabled {
            report
                .record(
                    integration_component(IntegrationKind::Mixer.as_str()),
                    "connect",
                    Outcome::Skipped,
                    Some("mixer control is not supported by this build".to_string()),
                )
                .await;
        }

        if let Some(desc) = self.presence.as_ref().filter(|_| flags.presence) {
            let broadcaster = PresenceBroadcaster::new(desc.pipe.clone());
            broadcaster
                .update_presence(&PresenceState::Playing {
                    game: game.id.clone(),
                    display_name: game.display_name.clone(),
                    since_unix_ms: now_unix_ms(),
                })
                .await;
            active.presence = Some(broadcaster);
        }

        active
    }

    async fn client_for<B>(
        &self,
        kind: IntegrationKind,
        desc: &IntegrationDescriptor<B>,
        report: &SharedReport,
        build: impl FnOnce(String) -> IntegrationClient,
    ) -> Option<IntegrationClient> {
        match desc.ws_url() {
            Some(url) => Some(build(url)),
            None => {
                report
                    .record(
                        integration_component(kind.as_str()),
                        "connect",
                        Outcome::Skipped,
                        Some("no endpoint configured".to_string()),
                    )
                    .await;
                None
            }
        }
    }

    async fn connect(
        &self,
        kind: IntegrationKind,
        mut client: IntegrationClient,
        report: &SharedReport,
    ) -> Option<ActiveIntegration> {
        let component = integration_component(kind.as_str());

        if !client.is_reachable() {
            report
                .record(component, "connect", Outcome::Skipped, Some("tool is not running".to_string()))
                .await;
            return None;
        }

        let first = match client.connect(self.connect_timeout).await {
            Ok(()) => {
                report
                    .record(component, "connect", Outcome::Succeeded, Some("connected".to_string()))
                    .await;
                return Some(ActiveIntegration {
                    kind,
                    client,
                    failed: None,
                });
            }
            Err(e) => e,
        };

        // Auth failures are not retried.
        if matches!(first, ChannelError::Auth(_)) {
            client.disconnect().await;
            report
                .record(component, "connect", Outcome::Skipped, Some(format!("unavailable: {first}")))
                .await;
            return None;
        }

        tracing::debug!(integration = kind.as_str(), error = %first, "connect failed; retrying once");
        tokio::time::sleep(self.retry_delay).await;

        match client.connect(self.connect_timeout).await {
            Ok(()) => {
                report
                    .record(
                        component,
                        "connect",
                        Outcome::Succeeded,
                        Some("connected on retry".to_string()),
                    )
                    .await;
                Some(ActiveIntegration {
                    kind,
                    client,
                    failed: None,
                })
            }
            Err(e) => {
                client.disconnect().await;
                report
                    .record(component, "connect", Outcome::Skipped, Some(format!("unavailable: {e}")))
                    .await;
                None
            }
        }
    }

    fn pre_actions(&self, kind: IntegrationKind) -> Vec<IntegrationAction> {
        let mut out = Vec::new();
        match kind {
            IntegrationKind::Recording => {
                if let Some(b) = self.recording.as_ref().map(|d| &d.behavior) {
                    if b.replay_buffer {
                        out.push(IntegrationAction::StartReplayBuffer);
                    }
                    if b.record {
                        out.push(IntegrationAction::StartRecording);
                    }
                }
            }
            IntegrationKind::Avatar => {
                if let Some(b) = self.avatar.as_ref().map(|d| &d.behavior) {
                    out.extend(b.model_id.clone().map(IntegrationAction::LoadModel));
                    out.extend(b.start_hotkey.clone().map(IntegrationAction::TriggerHotkey));
                }
            }
            IntegrationKind::Presence | IntegrationKind::Mixer => {}
        }
        out
    }

    fn post_actions(&self, kind: IntegrationKind, aborted: bool) -> Vec<IntegrationAction> {
        let mut out = Vec::new();
        match kind {
            IntegrationKind::Recording => {
                if let Some(b) = self.recording.as_ref().map(|d| &d.behavior) {
                    // Nothing worth keeping in the buffer if the game never ran.
                    if b.replay_buffer && b.save_replay_on_exit && !aborted {
                        out.push(IntegrationAction::SaveReplayBuffer);
                    }
                    if b.replay_buffer {
                        out.push(IntegrationAction::StopReplayBuffer);
                    }
                    if b.record {
                        out.push(IntegrationAction::StopRecording);
                    }
                }
            }
            IntegrationKind::Avatar => {
                if let Some(b) = self.avatar.as_ref().map(|d| &d.behavior) {
                    out.extend(b.end_hotkey.clone().map(IntegrationAction::TriggerHotkey));
                }
            }
            IntegrationKind::Presence | IntegrationKind::Mixer => {}
        }
        out
    }

    pub async fn run_pre_actions(&self, active: &mut ActiveIntegrations, report: &SharedReport) {
        for integration in &mut active.clients {
            let actions = self.pre_actions(integration.kind);
            self.run_actions(integration, &actions, report).await;
        }
    }

    /// `aborted` is set when the game never launched.
    pub async fn run_post_actions(&self, active: &mut ActiveIntegrations, report: &SharedReport, aborted: bool) {
        for integration in &mut active.clients {
            let actions = self.post_actions(integration.kind, aborted);
            self.run_actions(integration, &actions, report).await;
        }
    }

    async fn run_actions(
        &self,
        integration: &mut ActiveIntegration,
        actions: &[IntegrationAction],
        report: &SharedReport,
    ) {
        let component = integration_component(integration.kind.as_str());
        for action in actions {
            if let Some(reason) = &integration.failed {
                report
                    .record(
                        component.as_str(),
                        action.as_str(),
                        Outcome::Skipped,
                        Some(format!("integration failed earlier: {reason}")),
                    )
                    .await;
                continue;
            }

            match integration.client.perform(action, self.command_timeout).await {
                Ok(()) => {
                    report
                        .record(component.as_str(), action.as_str(), Outcome::Succeeded, None)
                        .await
                }
                Err(e) => {
                    if e.breaks_connection() {
                        integration.failed = Some(e.to_string());
                    }
                    report
                        .record(component.as_str(), action.as_str(), Outcome::Failed, Some(e.to_string()))
                        .await;
                }
            }
        }
    }

    /// Disconnects everything and publishes idle presence. Safe to call with
    /// an empty set.
    pub async fn deactivate(&self, active: &mut ActiveIntegrations) {
        for integration in &mut active.clients {
            integration.client.disconnect().await;
            tracing::debug!(integration = integration.kind.as_str(), "disconnected");
        }
        active.clients.clear();
        if let Some(presence) = active.presence.take() {
            presence.clear_presence().await;
        }
    }
}
