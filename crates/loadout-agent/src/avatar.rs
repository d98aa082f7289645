//! Avatar tool client (VTube Studio public API).

use std::time::Duration;

use serde_json::{Value, json};

use crate::control_channel::{ChannelError, ControlChannel, ControlClient, tool_process_running};
use crate::process_controller::ProcessController;

const API_NAME: &str = "VTubeStudioPublicAPI";
const API_VERSION: &str = "1.0";
const PLUGIN_NAME: &str = "loadout";
const PLUGIN_DEVELOPER: &str = "loadout";

fn correlate(frame: &Value) -> Option<String> {
    frame.get("requestID")?.as_str().map(str::to_string)
}

fn envelope(id: &str, message_type: &str, data: Value) -> Value {
    json!({
        "apiName": API_NAME,
        "apiVersion": API_VERSION,
        "requestID": id,
        "messageType": message_type,
        "data": data,
    })
}

pub struct AvatarClient {
    url: String,
    token: String,
    process_name: Option<String>,
    controller: ProcessController,
    channel: Option<ControlChannel>,
}

impl AvatarClient {
    pub fn new(url: String, token: String, process_name: Option<String>, controller: ProcessController) -> Self {
        Self {
            url,
            token,
            process_name,
            controller,
            channel: None,
        }
    }

    async fn call(
        ch: &ControlChannel,
        message_type: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let id = ch.next_request_id();
        let resp = ch.request(&id, &envelope(&id, message_type, data), timeout).await?;

        let kind = resp.get("messageType").and_then(Value::as_str).unwrap_or_default();
        let data = resp.get("data").cloned().unwrap_or(Value::Null);
        if kind == "APIError" {
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let code = data.get("errorID").and_then(Value::as_i64).unwrap_or_default();
            return Err(ChannelError::Rejected(format!("{message_type}: {message} (error {code})")));
        }
        Ok(data)
    }

    async fn authenticate(&mut self, ch: &ControlChannel, timeout: Duration) -> Result<(), ChannelError> {
        if self.token.is_empty() {
            let data = Self::call(
                ch,
                "AuthenticationTokenRequest",
                json!({ "pluginName": PLUGIN_NAME, "pluginDeveloper": PLUGIN_DEVELOPER }),
                timeout,
            )
            .await
            .map_err(|e| ChannelError::Auth(format!("token request not approved: {e}")))?;
            let token = data
                .get("authenticationToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ChannelError::Auth("tool issued no token".to_string()))?;
            tracing::info!(
                "avatar tool issued a new plugin token; store it as the avatar credential to skip approval next time"
            );
            self.token = token.to_string();
        }

        let data = Self::call(
            ch,
            "AuthenticationRequest",
            json!({
                "pluginName": PLUGIN_NAME,
                "pluginDeveloper": PLUGIN_DEVELOPER,
                "authenticationToken": self.token,
            }),
            timeout,
        )
        .await?;
        if data.get("authenticated").and_then(Value::as_bool) != Some(true) {
            let reason = data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("token not accepted");
            return Err(ChannelError::Auth(reason.to_string()));
        }
        Ok(())
    }

    pub async fn trigger_hotkey(&self, hotkey_id: &str, timeout: Duration) -> Result<(), ChannelError> {
        self.send_command("HotkeyTriggerRequest", json!({ "hotkeyID": hotkey_id }), timeout)
            .await
            .map(|_| ())
    }

    pub async fn load_model(&self, model_id: &str, timeout: Duration) -> Result<(), ChannelError> {
        self.send_command("ModelLoadRequest", json!({ "modelID": model_id }), timeout)
            .await
            .map(|_| ())
    }
}

impl ControlClient for AvatarClient {
    fn name(&self) -> &'static str {
        "avatar"
    }

    fn is_reachable(&self) -> bool {
        tool_process_running(&self.controller, self.process_name.as_deref())
    }

    /// `timeout` bounds the whole open plus authentication, including a token
    /// request that waits for the user to approve the plugin.
    async fn connect(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        self.disconnect().await;

        let url = self.url.clone();
        let attempt = async {
            let mut ch = ControlChannel::open(&url, timeout, correlate).await?;
            match self.authenticate(&ch, timeout).await {
                Ok(()) => Ok::<_, ChannelError>(ch),
                Err(e) => {
                    ch.close().await;
                    Err(e)
                }
            }
        };
        let ch = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;
        tracing::debug!(url = %self.url, "avatar tool authenticated");
        self.channel = Some(ch);
        Ok(())
    }

    async fn send_command(&self, command: &str, args: Value, timeout: Duration) -> Result<Value, ChannelError> {
        let ch = self.channel.as_ref().ok_or(ChannelError::NotConnected)?;
        Self::call(ch, command, args, timeout).await
    }

    async fn disconnect(&mut self) {
        if let Some(mut ch) = self.channel.take() {
            ch.close().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(ControlChannel::is_open)
    }
}
