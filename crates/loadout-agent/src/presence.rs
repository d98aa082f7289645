//! Status broadcast to a local presence bridge (chat/social "now playing").
//!
//! Each update is one JSON line written to a local pipe. There is no handshake
//! and no response; a missing bridge is normal.

use std::{path::PathBuf, time::Duration};

use loadout_model::GameId;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PresenceState {
    Playing {
        game: GameId,
        display_name: String,
        since_unix_ms: u64,
    },
    Idle,
}

#[allow(async_fn_in_trait)]
pub trait PresenceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Publishes `state`. Failures are swallowed.
    async fn update_presence(&self, state: &PresenceState);

    async fn clear_presence(&self) {
        self.update_presence(&PresenceState::Idle).await;
    }
}

pub fn default_pipe() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"\\.\pipe\loadout-presence")
    }
    #[cfg(not(windows))]
    {
        std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join("loadout-presence.sock")
    }
}

#[derive(Debug, Clone)]
pub struct PresenceBroadcaster {
    pipe: PathBuf,
}

impl PresenceBroadcaster {
    pub fn new(pipe: Option<PathBuf>) -> Self {
        Self {
            pipe: pipe.unwrap_or_else(default_pipe),
        }
    }

    async fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let mut stream = tokio::net::UnixStream::connect(&self.pipe).await?;
            stream.write_all(line).await?;
            stream.shutdown().await
        }
        #[cfg(windows)]
        {
            let mut pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(&self.pipe)?;
            pipe.write_all(line).await?;
            pipe.flush().await
        }
    }
}

impl PresenceProvider for PresenceBroadcaster {
    fn name(&self) -> &'static str {
        "presence"
    }

    async fn update_presence(&self, state: &PresenceState) {
        let mut line = match serde_json::to_vec(state) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "failed to encode presence state");
                return;
            }
        };
        line.push(b'\n');

        match tokio::time::timeout(WRITE_TIMEOUT, self.write_line(&line)).await {
            Ok(Ok(())) => tracing::debug!(pipe = %self.pipe.display(), "presence published"),
            Ok(Err(e)) => {
                tracing::debug!(pipe = %self.pipe.display(), error = %e, "presence bridge unavailable")
            }
            Err(_) => tracing::debug!(pipe = %self.pipe.display(), "presence write timed out"),
        }
    }
}
