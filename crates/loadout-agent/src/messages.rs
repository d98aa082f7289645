//! User-facing text, looked up by key.

use std::borrow::Cow;

use loadout_model::{Outcome, SessionReport, SessionState};

pub trait MessageCatalog {
    fn message(&self, key: &str) -> Option<Cow<'static, str>>;

    /// Like [`Self::message`], but an unknown key renders as the key itself.
    fn text(&self, key: &str) -> Cow<'static, str> {
        self.message(key).unwrap_or_else(|| Cow::Owned(key.to_string()))
    }
}

const ENGLISH: &[(&str, &str)] = &[
    ("summary.header", "Session for {game} finished: {state}"),
    ("summary.totals", "{succeeded} succeeded, {failed} failed, {skipped} skipped"),
    ("state.idle", "idle"),
    ("state.starting_apps", "starting apps"),
    ("state.activating_integrations", "activating integrations"),
    ("state.launching_game", "launching game"),
    ("state.monitoring", "game running"),
    ("state.deactivating_integrations", "deactivating integrations"),
    ("state.stopping_apps", "stopping apps"),
    ("state.complete", "complete"),
    ("state.aborted", "aborted"),
    ("outcome.succeeded", "ok"),
    ("outcome.failed", "failed"),
    ("outcome.skipped", "skipped"),
    ("outcome.fatal", "FATAL"),
    ("game.not_found", "No game with id {game} in the catalog"),
    ("game.list_empty", "No games configured"),
    ("config.ok", "Configuration is valid: {games} games, {apps} apps"),
    ("session.cancelling", "Cancelling session; the game keeps running"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinMessages;

impl MessageCatalog for BuiltinMessages {
    fn message(&self, key: &str) -> Option<Cow<'static, str>> {
        ENGLISH
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| Cow::Borrowed(*v))
    }
}

/// Replaces `{name}` placeholders.
pub fn fill(template: &str, args: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in args {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

fn state_key(state: SessionState) -> String {
    format!("state.{}", state.as_str())
}

fn outcome_key(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Succeeded => "outcome.succeeded",
        Outcome::Failed => "outcome.failed",
        Outcome::Skipped => "outcome.skipped",
        Outcome::Fatal => "outcome.fatal",
    }
}

pub fn render_summary(report: &SessionReport, catalog: &dyn MessageCatalog) -> String {
    let mut out = fill(
        &catalog.text("summary.header"),
        &[
            ("game", report.game.0.as_str()),
            ("state", &*catalog.text(&state_key(report.final_state))),
        ],
    );
    out.push('\n');

    for entry in &report.entries {
        let label = catalog.text(outcome_key(entry.outcome));
        out.push_str(&format!("  [{label:<7}] {} {}", entry.component, entry.action));
        if let Some(detail) = entry.detail.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(": ");
            out.push_str(detail);
        }
        out.push('\n');
    }

    out.push_str(&fill(
        &catalog.text("summary.totals"),
        &[
            ("succeeded", report.count(Outcome::Succeeded).to_string().as_str()),
            (
                "failed",
                (report.count(Outcome::Failed) + report.count(Outcome::Fatal))
                    .to_string()
                    .as_str(),
            ),
            ("skipped", report.count(Outcome::Skipped).to_string().as_str()),
        ],
    ));
    out
}
