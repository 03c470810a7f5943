//! Wiring: config, state file and controller into one service

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use netgate_core::registry::Settings;
use netgate_core::{
    AccessService, Config, IptablesController, MemoryController, NetworkAccessSynchronizer,
    NetworkRuleController, StateFile,
};

/// Load the config file, falling back to defaults for the implicit location
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        })),
    }
}

/// Build the service for one invocation
///
/// A dry run swaps in the recording controller and skips persistence, so
/// neither the firewall nor the state file changes.
pub fn build_service(
    config: &Config,
    state_override: Option<&Path>,
    dry_run: bool,
) -> anyhow::Result<AccessService> {
    let controller: Arc<dyn NetworkRuleController> = if dry_run {
        tracing::info!("Dry run: firewall calls are recorded, not executed");
        Arc::new(MemoryController::new())
    } else {
        Arc::new(IptablesController::new(config.firewall.clone()))
    };

    let path = match state_override {
        Some(path) => path.to_path_buf(),
        None => config.state_path()?,
    };
    let store = StateFile::new(path);

    let registry = store
        .load_or_init(Settings {
            max_devices_per_user: config.portal.max_devices_per_user,
        })
        .with_context(|| format!("Failed to load state from {}", store.path().display()))?;

    let service = AccessService::new(registry, NetworkAccessSynchronizer::new(controller));
    if dry_run {
        Ok(service)
    } else {
        tracing::debug!("State file: {}", store.path().display());
        Ok(service.with_store(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netgate_core::Role;

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[tokio::test]
    async fn test_new_state_uses_configured_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.portal.max_devices_per_user = 7;

        let service = build_service(&config, Some(&dir.path().join("state.json")), false).unwrap();
        assert_eq!(service.settings().await.max_devices_per_user, 7);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");

        let service = build_service(&Config::default(), Some(&state), true).unwrap();
        service.add_user("alice", Role::User).await.unwrap();
        assert!(!state.exists());

        let service = build_service(&Config::default(), Some(&state), false).unwrap();
        service.add_user("alice", Role::User).await.unwrap();
        assert!(state.exists());
    }
}
