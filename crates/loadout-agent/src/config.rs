//! Game/app catalog and integration settings, loaded from a TOML file.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use loadout_model::{AppAction, AppId, GameDescriptor, GameId, Integrations, LaunchPlatform, ManagedApp};
use serde::Deserialize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("games: duplicate id `{0}`")]
    DuplicateGame(GameId),
    #[error("apps: duplicate id `{0}`")]
    DuplicateApp(AppId),
    #[error("games.{0}.process_name: must not be empty")]
    EmptyProcessName(GameId),
    #[error("games.{0}.executable: required for direct and manual-exit launches")]
    MissingExecutable(GameId),
    #[error("games.{0}.store_id: required for storefront launches")]
    MissingStoreId(GameId),
    #[error("games.{game}.apps: unknown app `{app}`")]
    UnknownApp { game: GameId, app: AppId },
    #[error("integrations.{0}: enabled but host/port are not set")]
    MissingEndpoint(&'static str),
    #[error("apps.{app}: `{action}` needs {needs}")]
    UnresolvableApp {
        app: AppId,
        action: &'static str,
        needs: &'static str,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogFile {
    games: Vec<GameDescriptor>,
    apps: Vec<ManagedApp>,
    integrations: Integrations,
}

/// Validated, read-only configuration shared by every session.
#[derive(Debug, Clone)]
pub struct Catalog {
    games: BTreeMap<GameId, Arc<GameDescriptor>>,
    apps: BTreeMap<AppId, Arc<ManagedApp>>,
    integrations: Arc<Integrations>,
}

impl Catalog {
    pub fn from_parts(
        games: Vec<GameDescriptor>,
        apps: Vec<ManagedApp>,
        integrations: Integrations,
    ) -> Result<Self, ConfigError> {
        let mut app_map = BTreeMap::new();
        for app in apps {
            validate_app(&app)?;
            if app_map.contains_key(&app.id) {
                return Err(ConfigError::DuplicateApp(app.id));
            }
            app_map.insert(app.id.clone(), Arc::new(app));
        }

        let mut game_map = BTreeMap::new();
        for game in games {
            validate_game(&game, &app_map)?;
            if game_map.contains_key(&game.id) {
                return Err(ConfigError::DuplicateGame(game.id));
            }
            game_map.insert(game.id.clone(), Arc::new(game));
        }

        if integrations.recording.enabled && integrations.recording.ws_url().is_none() {
            return Err(ConfigError::MissingEndpoint("recording"));
        }
        if integrations.avatar.enabled && integrations.avatar.ws_url().is_none() {
            return Err(ConfigError::MissingEndpoint("avatar"));
        }

        Ok(Self {
            games: game_map,
            apps: app_map,
            integrations: Arc::new(integrations),
        })
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = toml::from_str(raw).context("failed to parse catalog")?;
        Ok(Self::from_parts(file.games, file.apps, file.integrations)?)
    }

    pub fn game(&self, id: &str) -> Option<Arc<GameDescriptor>> {
        self.games.get(&GameId(id.to_string())).cloned()
    }

    pub fn games(&self) -> impl Iterator<Item = &Arc<GameDescriptor>> {
        self.games.values()
    }

    pub fn apps(&self) -> impl Iterator<Item = &Arc<ManagedApp>> {
        self.apps.values()
    }

    /// Managed apps of `game`, in the order the game lists them.
    pub fn apps_for(&self, game: &GameDescriptor) -> Vec<Arc<ManagedApp>> {
        let mut seen = BTreeSet::new();
        game.apps
            .iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| self.apps.get(id).cloned())
            .collect()
    }

    pub fn integrations(&self) -> &Integrations {
        &self.integrations
    }
}

fn validate_game(game: &GameDescriptor, apps: &BTreeMap<AppId, Arc<ManagedApp>>) -> Result<(), ConfigError> {
    if game.process_name.trim().is_empty() {
        return Err(ConfigError::EmptyProcessName(game.id.clone()));
    }
    match &game.platform {
        LaunchPlatform::Direct | LaunchPlatform::ManualExit if game.executable.is_none() => {
            return Err(ConfigError::MissingExecutable(game.id.clone()));
        }
        LaunchPlatform::Storefront { .. }
            if game.store_id.as_deref().is_none_or(|s| s.trim().is_empty()) =>
        {
            return Err(ConfigError::MissingStoreId(game.id.clone()));
        }
        _ => {}
    }
    if let Some(app) = game.apps.iter().find(|id| !apps.contains_key(*id)) {
        return Err(ConfigError::UnknownApp {
            game: game.id.clone(),
            app: app.clone(),
        });
    }
    Ok(())
}

fn validate_app(app: &ManagedApp) -> Result<(), ConfigError> {
    for action in [app.start_action, app.end_action] {
        let needs = match action {
            AppAction::StartProcess | AppAction::TogglePersistentState if app.executable.is_none() => {
                "an executable"
            }
            AppAction::StopProcess if app.match_name().is_none() => "a process_name or executable",
            _ => continue,
        };
        return Err(ConfigError::UnresolvableApp {
            app: app.id.clone(),
            action: action.as_str(),
            needs,
        });
    }
    Ok(())
}

pub async fn load_catalog(path: &Path) -> anyhow::Result<Catalog> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Catalog::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

/// `<config dir>/loadout/loadout.toml`, e.g. `~/.config/loadout/loadout.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("loadout").join("loadout.toml"))
}
