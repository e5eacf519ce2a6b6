use std::{
    env, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exclusions::ExclusionRules;
use crate::history::DEFAULT_HISTORY_RETENTION;
use crate::orchestrator::SwapSettings;
use crate::selection::{SelectionPlan, SelectionPolicy, DEFAULT_RECENCY_HORIZON};
use crate::service::ServiceSettings;

pub const BUILTIN_VOTEMAP_CONFIG: &str = include_str!("data/votemap_config.json");

/// Service-level settings of the votemap daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VotemapConfig {
    pub options: SelectionPlan,
    /// Read option counts and exclusions from the remote tool's votemap
    /// settings each cycle; `options` and `exclusions` apply otherwise.
    pub use_remote_votemap_config: bool,
    pub exclusions: ExclusionRules,
    pub recency_horizon: u32,
    pub history_retention: usize,
    pub normalize_layer_counts: bool,
    pub run_on_round_start: bool,
    pub step_delay_ms: u64,
    pub seed: Option<u64>,
    pub weighting_path: Option<PathBuf>,
    pub command_bind: SocketAddr,
    pub alert_bind: SocketAddr,
}

impl Default for VotemapConfig {
    fn default() -> Self {
        Self {
            options: SelectionPlan::standard(),
            use_remote_votemap_config: true,
            exclusions: ExclusionRules::default(),
            recency_horizon: DEFAULT_RECENCY_HORIZON,
            history_retention: DEFAULT_HISTORY_RETENTION,
            normalize_layer_counts: false,
            run_on_round_start: true,
            step_delay_ms: 2000,
            seed: None,
            weighting_path: None,
            command_bind: SocketAddr::from(([127, 0, 0, 1], 41100)),
            alert_bind: SocketAddr::from(([127, 0, 0, 1], 41101)),
        }
    }
}

#[derive(Debug, Error)]
pub enum VotemapConfigError {
    #[error("failed to parse votemap config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read votemap config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("votemap config requests no options for any game mode")]
    EmptyPlan,
    #[error("history_retention must be at least 1")]
    ZeroRetention,
}

impl VotemapConfig {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            VotemapConfig::from_json_str(BUILTIN_VOTEMAP_CONFIG)
                .expect("builtin votemap config should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, VotemapConfigError> {
        let config: VotemapConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, VotemapConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| VotemapConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        VotemapConfig::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), VotemapConfigError> {
        if self.options.is_empty() {
            return Err(VotemapConfigError::EmptyPlan);
        }
        if self.history_retention == 0 {
            return Err(VotemapConfigError::ZeroRetention);
        }
        Ok(())
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            recency_horizon: self.recency_horizon,
            normalize_layer_counts: self.normalize_layer_counts,
            exclusions: self.exclusions,
        }
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn swap_settings(&self) -> SwapSettings {
        SwapSettings {
            plan: self.options.clone(),
            policy: self.selection_policy(),
            step_delay: self.step_delay(),
            use_remote_config: self.use_remote_votemap_config,
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            run_on_round_start: self.run_on_round_start,
            swap: self.swap_settings(),
            seed: self.seed,
        }
    }
}

/// Loads the service config from `VOTEMAP_CONFIG_PATH`, falling back to the
/// builtin defaults.
pub fn load_votemap_config_from_env() -> Arc<VotemapConfig> {
    if let Some(path) = env::var("VOTEMAP_CONFIG_PATH").ok().map(PathBuf::from) {
        match VotemapConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "votemap::config",
                    path = %path.display(),
                    "votemap_config.loaded=file"
                );
                return Arc::new(config);
            }
            Err(err) => {
                tracing::warn!(
                    target: "votemap::config",
                    path = %path.display(),
                    error = %err,
                    "votemap_config.load_failed"
                );
            }
        }
    }

    tracing::info!(target: "votemap::config", "votemap_config.loaded=builtin");
    VotemapConfig::builtin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use votemap_runtime::GameMode;

    #[test]
    fn builtin_config_matches_defaults() {
        let config = VotemapConfig::builtin();
        assert_eq!(*config, VotemapConfig::default());
        assert_eq!(config.options.count_for(GameMode::Warfare), 4);
        assert_eq!(config.options.count_for(GameMode::Offensive), 2);
        assert_eq!(config.options.count_for(GameMode::Control), 1);
        assert_eq!(config.step_delay(), Duration::from_secs(2));
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let config = VotemapConfig::from_json_str(
            r#"{"options": {"warfare": 6}, "seed": 42, "normalize_layer_counts": true}"#,
        )
        .unwrap();
        assert_eq!(config.options.total(), 6);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.recency_horizon, DEFAULT_RECENCY_HORIZON);
        assert!(config.selection_policy().normalize_layer_counts);
        assert!(config.service_settings().run_on_round_start);
        assert!(config.swap_settings().use_remote_config);
    }

    #[test]
    fn local_exclusions_reach_the_policy() {
        let config = VotemapConfig::from_json_str(
            r#"{
                "use_remote_votemap_config": false,
                "exclusions": {"number_last_played_to_exclude": 5, "allow_consecutive_skirmishes": true}
            }"#,
        )
        .unwrap();
        let settings = config.swap_settings();
        assert!(!settings.use_remote_config);
        assert_eq!(settings.policy.exclusions.number_last_played_to_exclude, 5);
        assert!(settings.policy.exclusions.allow_consecutive_skirmishes);
        assert!(!settings.policy.exclusions.allow_consecutive_offensives_opposite_sides);
    }

    #[test]
    fn rejects_invalid_documents() {
        let err = VotemapConfig::from_json_str(r#"{"options": {"warfare": 0}}"#).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"votemap config requests no options for any game mode");

        assert!(matches!(
            VotemapConfig::from_json_str(r#"{"history_retention": 0}"#),
            Err(VotemapConfigError::ZeroRetention)
        ));
        assert!(matches!(
            VotemapConfig::from_json_str(r#"{"num_warfare_options": 3}"#),
            Err(VotemapConfigError::Parse(_))
        ));
    }
}
