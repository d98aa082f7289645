use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 4000;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3000;
const DEFAULT_CONNECT_RETRY_DELAY_MS: u64 = 1500;
const DEFAULT_GRACEFUL_STOP_SEC: u64 = 5;
const DEFAULT_APP_WORKERS: usize = 4;
const DEFAULT_APP_ACTION_TIMEOUT_SEC: u64 = 15;
const DEFAULT_GAME_DISCOVERY_SEC: u64 = 120;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_ms(raw: Option<u64>, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(raw.map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Timeouts and limits used by one orchestrator.
///
/// Every knob can be overridden with a `LOADOUT_*` environment variable; values
/// outside the accepted range are clamped rather than rejected.
#[derive(Clone, Copy, Debug)]
pub struct Tuning {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub connect_retry_delay: Duration,
    pub graceful_stop: Duration,
    pub app_workers: usize,
    pub app_action_timeout: Duration,
    pub game_discovery_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            connect_retry_delay: Duration::from_millis(DEFAULT_CONNECT_RETRY_DELAY_MS),
            graceful_stop: Duration::from_secs(DEFAULT_GRACEFUL_STOP_SEC),
            app_workers: DEFAULT_APP_WORKERS,
            app_action_timeout: Duration::from_secs(DEFAULT_APP_ACTION_TIMEOUT_SEC),
            game_discovery_timeout: Duration::from_secs(DEFAULT_GAME_DISCOVERY_SEC),
        }
    }
}

impl Tuning {
    pub fn from_env() -> Self {
        Self {
            connect_timeout: parse_ms(
                env_u64("LOADOUT_CONNECT_TIMEOUT_MS"),
                DEFAULT_CONNECT_TIMEOUT_MS,
                500,
                30_000,
            ),
            command_timeout: parse_ms(
                env_u64("LOADOUT_COMMAND_TIMEOUT_MS"),
                DEFAULT_COMMAND_TIMEOUT_MS,
                250,
                30_000,
            ),
            connect_retry_delay: parse_ms(
                env_u64("LOADOUT_CONNECT_RETRY_DELAY_MS"),
                DEFAULT_CONNECT_RETRY_DELAY_MS,
                0,
                30_000,
            ),
            graceful_stop: Duration::from_secs(
                env_u64("LOADOUT_GRACEFUL_STOP_SEC")
                    .map(|v| v.clamp(1, 60))
                    .unwrap_or(DEFAULT_GRACEFUL_STOP_SEC),
            ),
            app_workers: env_usize("LOADOUT_APP_WORKERS")
                .map(|v| v.clamp(1, 16))
                .unwrap_or(DEFAULT_APP_WORKERS),
            app_action_timeout: Duration::from_secs(
                env_u64("LOADOUT_APP_ACTION_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 300))
                    .unwrap_or(DEFAULT_APP_ACTION_TIMEOUT_SEC),
            ),
            game_discovery_timeout: Duration::from_secs(
                env_u64("LOADOUT_GAME_DISCOVERY_SEC")
                    .map(|v| v.clamp(5, 30 * 60))
                    .unwrap_or(DEFAULT_GAME_DISCOVERY_SEC),
            ),
        }
    }
}

/// Renders an error and its causes as `outer: inner: root` for the log.
///
/// Many of our errors already embed their source in their own message, so a
/// cause whose text the previous message contains is left out.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut out = String::new();
    let mut previous = String::new();
    for message in err.chain().map(|cause| cause.to_string()) {
        if message.is_empty() || previous.contains(&message) {
            continue;
        }
        if !out.is_empty() {
            out.push_str(": ");
        }
        out.push_str(&message);
        previous = message;
    }
    if out.is_empty() {
        out.push_str("unknown error");
    }
    out
}
