//! Data contracts shared by the votemap crates.
//!
//! The wire types mirror the remote administration tool's REST payloads closely
//! enough to decode its map catalog and whitelist responses. [`MapLayer`] is the
//! flattened form the selection engine works with.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest identifier accepted for group names and map ids.
pub const IDENTIFIER_MAX_LEN: usize = 50;

/// Returns true when `value` matches `^[a-zA-Z0-9_]+$` and is at most
/// [`IDENTIFIER_MAX_LEN`] characters long.
pub fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= IDENTIFIER_MAX_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_')
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Lighting/weather variant of a layer. Closed set.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dawn,
    #[default]
    Day,
    Dusk,
    Night,
    Overcast,
    Rain,
}

impl Environment {
    pub const ALL: [Environment; 6] = [
        Environment::Dawn,
        Environment::Day,
        Environment::Dusk,
        Environment::Night,
        Environment::Overcast,
        Environment::Rain,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Dawn => "dawn",
            Environment::Day => "day",
            Environment::Dusk => "dusk",
            Environment::Night => "night",
            Environment::Overcast => "overcast",
            Environment::Rain => "rain",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Environment::ALL
            .into_iter()
            .find(|environment| environment.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownVariant {
                kind: "environment",
                value: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Warfare,
    Offensive,
    Control,
    Phased,
    Majority,
}

impl GameMode {
    pub const ALL: [GameMode; 5] = [
        GameMode::Warfare,
        GameMode::Offensive,
        GameMode::Control,
        GameMode::Phased,
        GameMode::Majority,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Warfare => "warfare",
            GameMode::Offensive => "offensive",
            GameMode::Control => "control",
            GameMode::Phased => "phased",
            GameMode::Majority => "majority",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameMode {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        GameMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownVariant {
                kind: "game mode",
                value: value.to_string(),
            })
    }
}

/// Side of an offensive layer that attacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Allies,
    Axis,
}

impl Team {
    pub fn opponent(self) -> Team {
        match self {
            Team::Allies => Team::Axis,
            Team::Axis => Team::Allies,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Team::Allies => "allies",
            Team::Axis => "axis",
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A votable map+environment variant as offered by the remote tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapLayer {
    pub id: String,
    pub map: String,
    pub environment: Environment,
    pub game_mode: GameMode,
    /// Attacking side; only offensive layers carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attackers: Option<Team>,
}

impl MapLayer {
    pub fn new(
        id: impl Into<String>,
        map: impl Into<String>,
        environment: Environment,
        game_mode: GameMode,
    ) -> Self {
        Self {
            id: id.into(),
            map: map.into(),
            environment,
            game_mode,
            attackers: None,
        }
    }

    pub fn with_attackers(mut self, attackers: Team) -> Self {
        self.attackers = Some(attackers);
        self
    }
}

/// Catalog entry as returned by `api/get_maps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: String,
    pub map: MapRecord,
    pub game_mode: GameMode,
    #[serde(default)]
    pub attackers: Option<Team>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub pretty_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pretty_name: Option<String>,
}

impl From<LayerRecord> for MapLayer {
    fn from(record: LayerRecord) -> Self {
        MapLayer {
            id: record.id,
            map: record.map.id,
            environment: record.environment,
            game_mode: record.game_mode,
            attackers: record.attackers,
        }
    }
}

/// Votemap settings held by the remote tool, as returned by
/// `api/get_votemap_config`. Only the fields that shape the offered options
/// are decoded; defaults follow the remote tool's own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotemapUserConfig {
    pub enabled: bool,
    pub number_last_played_to_exclude: usize,
    pub num_warfare_options: usize,
    pub num_offensive_options: usize,
    pub num_skirmish_control_options: usize,
    pub consider_offensive_same_map: bool,
    pub consider_skirmishes_as_same_map: bool,
    pub allow_consecutive_offensives: bool,
    pub allow_consecutive_offensives_opposite_sides: bool,
    pub allow_consecutive_skirmishes: bool,
}

impl Default for VotemapUserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            number_last_played_to_exclude: 3,
            num_warfare_options: 4,
            num_offensive_options: 2,
            num_skirmish_control_options: 1,
            consider_offensive_same_map: true,
            consider_skirmishes_as_same_map: true,
            allow_consecutive_offensives: true,
            allow_consecutive_offensives_opposite_sides: false,
            allow_consecutive_skirmishes: false,
        }
    }
}

/// Standard response envelope of the remote tool. The payload, if any, is in
/// `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub command: String,
    pub failed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub result: Option<T>,
}

/// Decodes a catalog dump, accepting either the full `api/get_maps` envelope
/// or a bare array of layer records.
pub fn catalog_from_json(json: &str) -> Result<Vec<MapLayer>, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CatalogDump {
        Envelope(ApiResult<Vec<LayerRecord>>),
        Bare(Vec<LayerRecord>),
    }

    let records = match serde_json::from_str::<CatalogDump>(json)? {
        CatalogDump::Envelope(envelope) => envelope.result.unwrap_or_default(),
        CatalogDump::Bare(records) => records,
    };
    Ok(records.into_iter().map(MapLayer::from).collect())
}

/// The remote whitelist as captured immediately before a swap mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistSnapshot {
    layer_ids: Vec<String>,
}

impl WhitelistSnapshot {
    pub fn new(layer_ids: Vec<String>) -> Self {
        Self { layer_ids }
    }

    pub fn layer_ids(&self) -> &[String] {
        &self.layer_ids
    }

    pub fn len(&self) -> usize {
        self.layer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layer_ids.is_empty()
    }

    pub fn into_inner(self) -> Vec<String> {
        self.layer_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_follow_the_restricted_charset() {
        assert!(is_identifier("carentan"));
        assert!(is_identifier("Top_Maps_2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("st-mere"));
        assert!(!is_identifier("omaha beach"));
        assert!(is_identifier(&"a".repeat(IDENTIFIER_MAX_LEN)));
        assert!(!is_identifier(&"a".repeat(IDENTIFIER_MAX_LEN + 1)));
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("Night".parse::<Environment>(), Ok(Environment::Night));
        let err = "sunset".parse::<Environment>().unwrap_err();
        assert_eq!(err.to_string(), "unknown environment 'sunset'");
    }

    #[test]
    fn catalog_envelope_decodes_into_layers() {
        let json = r#"{
            "command": "get_maps",
            "failed": false,
            "error": null,
            "version": "v10.0.0",
            "result": [
                {"id": "carentan_warfare", "map": {"id": "carentan"}, "game_mode": "warfare"},
                {"id": "foy_offensive_night", "map": {"id": "foy", "name": "FOY"},
                 "game_mode": "offensive", "environment": "night"}
            ]
        }"#;

        let layers = catalog_from_json(json).expect("catalog decodes");
        assert_eq!(
            layers,
            vec![
                MapLayer::new("carentan_warfare", "carentan", Environment::Day, GameMode::Warfare),
                MapLayer::new("foy_offensive_night", "foy", Environment::Night, GameMode::Offensive),
            ]
        );
    }

    #[test]
    fn bare_catalog_array_decodes() {
        let json = r#"[{"id": "hill400_warfare_dusk", "map": {"id": "hill400"},
                        "game_mode": "warfare", "environment": "dusk"}]"#;
        let layers = catalog_from_json(json).expect("catalog decodes");
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].environment, Environment::Dusk);
    }

    #[test]
    fn offensive_layers_keep_their_attackers() {
        let json = r#"[{"id": "foy_offensive_ger", "map": {"id": "foy"},
                        "game_mode": "offensive", "attackers": "axis"}]"#;
        let layers = catalog_from_json(json).expect("catalog decodes");
        assert_eq!(layers[0].attackers, Some(Team::Axis));
        assert_eq!(Team::Axis.opponent(), Team::Allies);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct NoDefault {
        layers: Vec<String>,
    }

    #[test]
    fn envelope_without_result_decodes_for_any_payload() {
        let json = r#"{"command": "get_votemap_whitelist", "failed": true, "error": "boom"}"#;
        let envelope: ApiResult<NoDefault> = serde_json::from_str(json).expect("envelope decodes");
        assert!(envelope.failed);
        assert_eq!(envelope.error.as_deref(), Some("boom"));
        assert_eq!(envelope.result, None);
    }

    #[test]
    fn votemap_config_fills_missing_fields_with_remote_defaults() {
        let config: VotemapUserConfig =
            serde_json::from_str(r#"{"num_warfare_options": 5, "default_method": "least_played"}"#)
                .expect("config decodes");
        assert_eq!(config.num_warfare_options, 5);
        assert_eq!(config.num_offensive_options, 2);
        assert_eq!(config.number_last_played_to_exclude, 3);
        assert!(!config.allow_consecutive_skirmishes);
    }
}
