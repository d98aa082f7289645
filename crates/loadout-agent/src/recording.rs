//! Recording tool client (obs-websocket protocol v5).

use std::time::Duration;

use base64::Engine;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::control_channel::{ChannelError, ControlChannel, ControlClient, tool_process_running};
use crate::process_controller::ProcessController;

const RPC_VERSION: u64 = 1;

mod op {
    pub const HELLO: u64 = 0;
    pub const IDENTIFY: u64 = 1;
    pub const IDENTIFIED: u64 = 2;
    pub const REQUEST: u64 = 6;
    pub const REQUEST_RESPONSE: u64 = 7;
}

// Request status codes that mean "already in the requested state".
const OUTPUT_RUNNING: i64 = 500;
const OUTPUT_NOT_RUNNING: i64 = 501;

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let b64 = base64::engine::general_purpose::STANDARD;
    let secret = b64.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    b64.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

fn correlate(frame: &Value) -> Option<String> {
    if frame.get("op")?.as_u64()? != op::REQUEST_RESPONSE {
        return None;
    }
    frame.get("d")?.get("requestId")?.as_str().map(str::to_string)
}

fn frame_op(frame: &Value) -> Option<u64> {
    frame.get("op").and_then(Value::as_u64)
}

pub struct RecordingClient {
    url: String,
    password: String,
    process_name: Option<String>,
    controller: ProcessController,
    channel: Option<ControlChannel>,
}

impl RecordingClient {
    pub fn new(
        url: String,
        password: String,
        process_name: Option<String>,
        controller: ProcessController,
    ) -> Self {
        Self {
            url,
            password,
            process_name,
            controller,
            channel: None,
        }
    }

    async fn handshake(&self, ch: &mut ControlChannel, timeout: Duration) -> Result<(), ChannelError> {
        let hello = ch.next_unsolicited(timeout).await?;
        if frame_op(&hello) != Some(op::HELLO) {
            return Err(ChannelError::Protocol("expected Hello as first frame".to_string()));
        }

        let mut identify = json!({
            "rpcVersion": RPC_VERSION,
            // No event subscriptions; we only issue requests.
            "eventSubscriptions": 0,
        });
        if let Some(auth) = hello.pointer("/d/authentication") {
            if self.password.is_empty() {
                return Err(ChannelError::Auth(
                    "recording tool requires a password but none is configured".to_string(),
                ));
            }
            let challenge = auth.get("challenge").and_then(Value::as_str).unwrap_or_default();
            let salt = auth.get("salt").and_then(Value::as_str).unwrap_or_default();
            identify["authentication"] = Value::String(auth_response(&self.password, salt, challenge));
        }
        ch.send(&json!({ "op": op::IDENTIFY, "d": identify })).await?;

        match ch.next_unsolicited(timeout).await {
            Ok(frame) if frame_op(&frame) == Some(op::IDENTIFIED) => Ok(()),
            Ok(frame) => Err(ChannelError::Protocol(format!(
                "expected Identified, got op {:?}",
                frame_op(&frame)
            ))),
            // The server closes the socket when authentication fails.
            Err(ChannelError::Closed) => Err(ChannelError::Auth("identification rejected".to_string())),
            Err(e) => Err(e),
        }
    }

    async fn output_command(&self, command: &str, already: i64, timeout: Duration) -> Result<(), ChannelError> {
        match self.request(command, json!({}), timeout).await {
            Ok(_) => Ok(()),
            Err(RequestFailure::Status { code, .. }) if code == already => Ok(()),
            Err(f) => Err(f.into()),
        }
    }

    async fn request(&self, command: &str, args: Value, timeout: Duration) -> Result<Value, RequestFailure> {
        let ch = self.channel.as_ref().ok_or(ChannelError::NotConnected)?;
        let id = ch.next_request_id();
        let frame = json!({
            "op": op::REQUEST,
            "d": { "requestType": command, "requestId": id, "requestData": args },
        });
        let resp = ch.request(&id, &frame, timeout).await?;

        let status = resp
            .pointer("/d/requestStatus")
            .ok_or_else(|| ChannelError::Protocol("response without requestStatus".to_string()))?;
        if status.get("result").and_then(Value::as_bool) == Some(true) {
            return Ok(resp.pointer("/d/responseData").cloned().unwrap_or(Value::Null));
        }
        Err(RequestFailure::Status {
            code: status.get("code").and_then(Value::as_i64).unwrap_or_default(),
            comment: status
                .get("comment")
                .and_then(Value::as_str)
                .unwrap_or("no comment")
                .to_string(),
            command: command.to_string(),
        })
    }

    pub async fn start_buffered_recording(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.output_command("StartReplayBuffer", OUTPUT_RUNNING, timeout).await
    }

    pub async fn stop_buffered_recording(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.output_command("StopReplayBuffer", OUTPUT_NOT_RUNNING, timeout).await
    }

    pub async fn save_buffered_recording(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.send_command("SaveReplayBuffer", json!({}), timeout).await.map(|_| ())
    }

    pub async fn start_recording(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.output_command("StartRecord", OUTPUT_RUNNING, timeout).await
    }

    pub async fn stop_recording(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.output_command("StopRecord", OUTPUT_NOT_RUNNING, timeout).await
    }
}

enum RequestFailure {
    Channel(ChannelError),
    Status {
        code: i64,
        comment: String,
        command: String,
    },
}

impl From<ChannelError> for RequestFailure {
    fn from(e: ChannelError) -> Self {
        RequestFailure::Channel(e)
    }
}

impl From<RequestFailure> for ChannelError {
    fn from(f: RequestFailure) -> Self {
        match f {
            RequestFailure::Channel(e) => e,
            RequestFailure::Status {
                code,
                comment,
                command,
            } => ChannelError::Rejected(format!("{command}: {comment} (code {code})")),
        }
    }
}

impl ControlClient for RecordingClient {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn is_reachable(&self) -> bool {
        tool_process_running(&self.controller, self.process_name.as_deref())
    }

    /// `timeout` bounds the whole open plus handshake, not each step.
    async fn connect(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        self.disconnect().await;

        let attempt = async {
            let mut ch = ControlChannel::open(&self.url, timeout, correlate).await?;
            match self.handshake(&mut ch, timeout).await {
                Ok(()) => Ok::<_, ChannelError>(ch),
                Err(e) => {
                    ch.close().await;
                    Err(e)
                }
            }
        };
        // Dropping a half-open channel aborts its tasks.
        let ch = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;
        tracing::debug!(url = %self.url, "recording tool identified");
        self.channel = Some(ch);
        Ok(())
    }

    async fn send_command(&self, command: &str, args: Value, timeout: Duration) -> Result<Value, ChannelError> {
        self.request(command, args, timeout).await.map_err(ChannelError::from)
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


#[cfg(test)]
mod tests {
    use super::fake::FakeRecorder;
    use super::*;

    fn client(url: String, password: &str) -> RecordingClient {
        RecordingClient::new(url, password.to_string(), None, ProcessController::new())
    }

    #[test]
    fn auth_response_is_deterministic_and_salted() {
        let a = auth_response("hunter2", "salt", "challenge");
        assert_eq!(a, auth_response("hunter2", "salt", "challenge"));
        assert_ne!(a, auth_response("hunter2", "other", "challenge"));
        assert_ne!(a, auth_response("hunter3", "salt", "challenge"));
    }

    #[test]
    fn only_request_responses_are_correlated() {
        let resp = json!({ "op": 7, "d": { "requestId": "loadout-1" } });
        let event = json!({ "op": 5, "d": { "requestId": "loadout-1" } });
        assert_eq!(correlate(&resp).as_deref(), Some("loadout-1"));
        assert_eq!(correlate(&event), None);
    }

    #[tokio::test]
    async fn connects_with_password_and_issues_commands() {
        let fake = FakeRecorder {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let url = fake.clone().serve().await;

        let mut c = client(url, "hunter2");
        c.connect(Duration::from_secs(2)).await.unwrap();
        assert!(c.is_connected());

        c.start_buffered_recording(Duration::from_secs(2)).await.unwrap();
        c.stop_buffered_recording(Duration::from_secs(2)).await.unwrap();
        assert_eq!(fake.received(), vec!["StartReplayBuffer", "StopReplayBuffer"]);

        c.disconnect().await;
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn wrong_password_is_an_auth_error() {
        let fake = FakeRecorder {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let url = fake.serve().await;

        let mut c = client(url, "wrong");
        let err = c.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Auth(_)), "{err:?}");
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn missing_password_is_rejected_before_identify() {
        let fake = FakeRecorder {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let url = fake.serve().await;

        let mut c = client(url, "");
        let err = c.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Auth(_)));
    }

    #[tokio::test]
    async fn connect_timeout_covers_the_whole_handshake() {
        let fake = FakeRecorder {
            handshake_delay: Duration::from_millis(400),
            ..Default::default()
        };
        let url = fake.serve().await;

        let mut c = client(url, "");
        let started = std::time::Instant::now();
        let err = c.connect(Duration::from_millis(600)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_millis(800), "{:?}", started.elapsed());
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn command_without_connection_is_not_connected() {
        let c = client("ws://127.0.0.1:9".to_string(), "");
        let err = c.start_buffered_recording(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_twice_is_fine() {
        let url = FakeRecorder::default().serve().await;
        let mut c = client(url, "");
        c.disconnect().await;
        c.connect(Duration::from_secs(2)).await.unwrap();
        c.disconnect().await;
        c.disconnect().await;
        assert!(!c.is_connected());
    }
}
