//! Configuration system for Tidemark.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Configuration is
//! loaded from `~/.config/tidemark/config.toml` and/or `.tidemark/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory, relative to the workspace, holding Tidemark state and config.
pub const WORKSPACE_DIR: &str = ".tidemark";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TidemarkConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

/// Control-plane database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; relative paths resolve against the workspace.
    pub database_path: PathBuf,
    /// How long to wait on a locked database before failing with `Busy`.
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".tidemark/warehouse.db"),
            busy_timeout_ms: 5000,
        }
    }
}

/// Landing-zone scanning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub root: PathBuf,
    pub max_workers: usize,
    pub extensions: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/bronze"),
            max_workers: 8,
            extensions: vec![
                "parquet".to_string(),
                "csv".to_string(),
                "json".to_string(),
                "jsonl".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// YAML file with a top-level `routes:` list.
    pub rules_path: PathBuf,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from(".tidemark/routes.yaml"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Replaces every contract's layer on publish when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    pub transform_version: String,
    /// Directory of `*.yaml` / `*.yml` contracts.
    pub contracts_dir: PathBuf,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            layer: None,
            transform_version: env!("CARGO_PKG_VERSION").to_string(),
            contracts_dir: PathBuf::from(".tidemark/contracts"),
        }
    }
}

impl TidemarkConfig {
    /// Resolve every relative path in the config against `workspace`.
    pub fn resolve_paths(mut self, workspace: &Path) -> Self {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = workspace.join(&*p);
            }
        };
        resolve(&mut self.storage.database_path);
        resolve(&mut self.discovery.root);
        resolve(&mut self.routing.rules_path);
        resolve(&mut self.publish.contracts_dir);
        self
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "tidemark", "tidemark")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from the standard layers.
///
/// Priority, high to low: `overrides`, environment (`TIDEMARK_STORAGE__DATABASE_PATH`
/// and friends), `<workspace>/.tidemark/config.toml`, the user config file,
/// built-in defaults.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TidemarkConfig>,
) -> Result<TidemarkConfig, Box<figment::Error>> {
    load_config_with(workspace, None, overrides)
}

/// Like [`load_config`], with an extra explicit config file merged above the
/// workspace file.
pub fn load_config_with(
    workspace: Option<&Path>,
    extra_file: Option<&Path>,
    overrides: Option<&TidemarkConfig>,
) -> Result<TidemarkConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TidemarkConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_DIR).join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(extra) = extra_file {
        figment = figment.merge(Toml::file(extra));
    }

    figment = figment.merge(Env::prefixed("TIDEMARK_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(WORKSPACE_DIR).join("config.toml").exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TidemarkConfig::default();
        assert_eq!(config.storage.database_path, PathBuf::from(".tidemark/warehouse.db"));
        assert_eq!(config.storage.busy_timeout(), Duration::from_millis(5000));
        assert_eq!(config.discovery.max_workers, 8);
        assert_eq!(config.discovery.extensions.len(), 4);
        assert_eq!(config.publish.layer, None);
        assert_eq!(config.publish.transform_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = TidemarkConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: TidemarkConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_workspace_file_layers_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(WORKSPACE_DIR)).unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_DIR).join("config.toml"),
            "[discovery]\nmax_workers = 2\n\n[publish]\nlayer = \"gold\"\n",
        )
        .unwrap();

        assert!(config_exists(Some(dir.path())));
        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.discovery.max_workers, 2);
        assert_eq!(config.publish.layer.as_deref(), Some("gold"));
        assert_eq!(config.storage.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = TidemarkConfig::default();
        overrides.storage.busy_timeout_ms = 50;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.storage.busy_timeout_ms, 50);
    }

    #[test]
    fn test_resolve_paths() {
        let config = TidemarkConfig::default().resolve_paths(Path::new("/ws"));
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/ws/.tidemark/warehouse.db")
        );
        assert_eq!(config.discovery.root, PathBuf::from("/ws/data/bronze"));

        let mut absolute = TidemarkConfig::default();
        absolute.routing.rules_path = PathBuf::from("/etc/routes.yaml");
        let resolved = absolute.resolve_paths(Path::new("/ws"));
        assert_eq!(resolved.routing.rules_path, PathBuf::from("/etc/routes.yaml"));
    }
}
