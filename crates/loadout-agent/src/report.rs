use std::sync::Arc;

use loadout_model::{AppId, GameId, Outcome, ReportEntry, SessionId, SessionReport, SessionState};
use tokio::sync::Mutex;

const MAX_DETAIL_BYTES: usize = 2 * 1024;

pub const GAME: &str = "game";

pub fn app_component(id: &AppId) -> String {
    format!("app:{id}")
}

pub fn integration_component(name: &str) -> String {
    format!("integration:{name}")
}

/// Caps a report detail at `max_bytes`, cutting on a char boundary and
/// noting how much was dropped.
fn clip_detail(detail: String, max_bytes: usize) -> String {
    if detail.len() <= max_bytes {
        return detail;
    }
    // Room for the ` [+N bytes]` marker.
    let mut end = max_bytes.saturating_sub(24);
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    let dropped = detail.len() - end;
    format!("{} [+{dropped} bytes]", &detail[..end])
}

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Outcome log of one session, appended to from concurrent tasks.
#[derive(Clone, Debug, Default)]
pub struct SharedReport {
    entries: Arc<Mutex<Vec<ReportEntry>>>,
}

impl SharedReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(
        &self,
        component: impl Into<String>,
        action: impl Into<String>,
        outcome: Outcome,
        detail: Option<String>,
    ) {
        let entry = ReportEntry {
            component: component.into(),
            action: action.into(),
            outcome,
            detail: detail.map(|d| clip_detail(d, MAX_DETAIL_BYTES)),
            at_unix_ms: now_unix_ms(),
        };

        let detail = entry.detail.as_deref().unwrap_or("");
        match outcome {
            Outcome::Succeeded | Outcome::Skipped => tracing::info!(
                component = %entry.component,
                action = %entry.action,
                outcome = ?outcome,
                detail,
                "action outcome"
            ),
            Outcome::Failed | Outcome::Fatal => tracing::warn!(
                component = %entry.component,
                action = %entry.action,
                outcome = ?outcome,
                detail,
                "action outcome"
            ),
        }

        self.entries.lock().await.push(entry);
    }

    pub async fn snapshot(&self) -> Vec<ReportEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn finish(
        &self,
        session_id: SessionId,
        game: GameId,
        final_state: SessionState,
    ) -> SessionReport {
        SessionReport {
            session_id,
            game,
            final_state,
            entries: self.snapshot().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_char_boundaries_and_counts_the_rest() {
        let long = "é".repeat(MAX_DETAIL_BYTES);
        let out = clip_detail(long, MAX_DETAIL_BYTES);
        assert!(out.len() <= MAX_DETAIL_BYTES);
        let kept = out.split(" [+").next().unwrap().len();
        assert!(out.ends_with(&format!(" [+{} bytes]", 2 * MAX_DETAIL_BYTES - kept)));
    }

    #[test]
    fn short_detail_is_untouched() {
        assert_eq!(clip_detail("connected".to_string(), MAX_DETAIL_BYTES), "connected");
    }

    #[tokio::test]
    async fn concurrent_records_are_all_kept() {
        let report = SharedReport::new();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let report = report.clone();
            tasks.push(tokio::spawn(async move {
                report
                    .record(format!("app:{i}"), "start", Outcome::Succeeded, None)
                    .await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let done = report
            .finish(SessionId::new(), GameId("g".to_string()), SessionState::Complete)
            .await;
        assert_eq!(done.entries.len(), 16);
        assert_eq!(done.count(Outcome::Succeeded), 16);
    }

    #[tokio::test]
    async fn long_details_are_truncated_on_record() {
        let report = SharedReport::new();
        report
            .record(GAME, "launch", Outcome::Fatal, Some("x".repeat(10_000)))
            .await;
        let entries = report.snapshot().await;
        assert!(entries[0].detail.as_ref().unwrap().len() <= MAX_DETAIL_BYTES);
    }
}
