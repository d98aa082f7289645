//! Handing a game launch to a storefront client through its URL scheme.

use std::{path::PathBuf, process::Stdio};

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum StorefrontError {
    #[error("unknown storefront `{0}`")]
    UnknownStore(String),
    #[error("failed to open {uri}: {source}")]
    Open {
        uri: String,
        #[source]
        source: std::io::Error,
    },
}

/// Asks a storefront client to start a game. Returns once the request has
/// been handed off; the game itself is located afterwards by process name.
pub trait StorefrontLauncher: Send + Sync {
    fn launch(&self, store: &str, store_id: &str) -> Result<(), StorefrontError>;
}

pub fn launch_uri(store: &str, store_id: &str) -> Result<String, StorefrontError> {
    let id = store_id.trim();
    match store.trim().to_ascii_lowercase().as_str() {
        "steam" => Ok(format!("steam://rungameid/{id}")),
        "epic" => Ok(format!(
            "com.epicgames.launcher://apps/{id}?action=launch&silent=true"
        )),
        "uri" => Ok(id.to_string()),
        other => Err(StorefrontError::UnknownStore(other.to_string())),
    }
}

/// Opens the launch URI with the desktop's URL handler, or with `opener` when
/// one is set.
#[derive(Debug, Clone, Default)]
pub struct SystemStorefront {
    opener: Option<PathBuf>,
}

impl SystemStorefront {
    pub fn with_opener(opener: impl Into<PathBuf>) -> Self {
        Self {
            opener: Some(opener.into()),
        }
    }

    /// Uses `LOADOUT_URL_OPENER` as the opener when it is set.
    pub fn from_env() -> Self {
        match std::env::var_os("LOADOUT_URL_OPENER").filter(|v| !v.is_empty()) {
            Some(opener) => Self::with_opener(opener),
            None => Self::default(),
        }
    }

    fn command(&self, uri: &str) -> Command {
        if let Some(opener) = &self.opener {
            let mut c = Command::new(opener);
            c.arg(uri);
            return c;
        }

        #[cfg(windows)]
        let c = {
            let mut c = Command::new("cmd");
            // The empty argument is the window title `start` expects.
            c.args(["/C", "start", ""]).arg(uri);
            c
        };
        #[cfg(target_os = "macos")]
        let c = {
            let mut c = Command::new("open");
            c.arg(uri);
            c
        };
        #[cfg(all(unix, not(target_os = "macos")))]
        let c = {
            let mut c = Command::new("xdg-open");
            c.arg(uri);
            c
        };
        c
    }
}

impl StorefrontLauncher for SystemStorefront {
    fn launch(&self, store: &str, store_id: &str) -> Result<(), StorefrontError> {
        let uri = launch_uri(store, store_id)?;

        let mut child = self
            .command(&uri)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| StorefrontError::Open {
                uri: uri.clone(),
                source,
            })?;
        // The opener exits as soon as the handler has the URI.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        tracing::info!(%uri, "handed launch to storefront");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_stores_build_launch_uris() {
        assert_eq!(launch_uri("steam", "1245620").unwrap(), "steam://rungameid/1245620");
        assert_eq!(
            launch_uri("Epic", "Fortnite").unwrap(),
            "com.epicgames.launcher://apps/Fortnite?action=launch&silent=true"
        );
        assert_eq!(launch_uri("uri", " itch://games/42 ").unwrap(), "itch://games/42");
    }

    #[test]
    fn unknown_store_is_an_error() {
        let err = launch_uri("gog-galaxy", "1").unwrap_err();
        assert!(matches!(err, StorefrontError::UnknownStore(ref s) if s == "gog-galaxy"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_hands_the_uri_to_the_opener() {
        let store = SystemStorefront::with_opener("true");
        store.launch("steam", "1245620").unwrap();
    }

    #[tokio::test]
    async fn missing_opener_is_an_open_error() {
        let store = SystemStorefront::with_opener("/nonexistent/loadout/opener");
        let err = store.launch("steam", "1").unwrap_err();
        assert!(matches!(err, StorefrontError::Open { ref uri, .. } if uri == "steam://rungameid/1"));
    }

    #[tokio::test]
    async fn unknown_store_never_spawns_the_opener() {
        let store = SystemStorefront::with_opener("/nonexistent/loadout/opener");
        let err = store.launch("gog-galaxy", "1").unwrap_err();
        assert!(matches!(err, StorefrontError::UnknownStore(_)));
    }
}
