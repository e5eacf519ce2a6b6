//! Rotation rules that take layers out of the vote before they are scored.
//!
//! The round being played is the newest history record; the rounds before it
//! are the recently played ones. Its exact layer is only known when the round
//! start named it, and the consecutive-mode rules are skipped otherwise.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use votemap_runtime::{GameMode, MapLayer, Team, VotemapUserConfig};

use crate::history::HistorySnapshot;
use crate::selection::SelectionPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExclusionRules {
    /// Rounds before the current one whose layers may not be offered.
    pub number_last_played_to_exclude: usize,
    /// Offensive layers on a recently played map are left out.
    pub consider_offensive_same_map: bool,
    /// Control layers on a recently played map are left out.
    pub consider_skirmishes_as_same_map: bool,
    pub allow_consecutive_offensives: bool,
    /// With this off, an offensive follow-up must keep the current attackers.
    pub allow_consecutive_offensives_opposite_sides: bool,
    pub allow_consecutive_skirmishes: bool,
}

impl ExclusionRules {
    /// Rules that exclude nothing beyond the current layer.
    pub fn none() -> Self {
        Self {
            number_last_played_to_exclude: 0,
            consider_offensive_same_map: false,
            consider_skirmishes_as_same_map: false,
            allow_consecutive_offensives: true,
            allow_consecutive_offensives_opposite_sides: true,
            allow_consecutive_skirmishes: true,
        }
    }
}

impl Default for ExclusionRules {
    fn default() -> Self {
        Self::from(&VotemapUserConfig::default())
    }
}

impl From<&VotemapUserConfig> for ExclusionRules {
    fn from(config: &VotemapUserConfig) -> Self {
        Self {
            number_last_played_to_exclude: config.number_last_played_to_exclude,
            consider_offensive_same_map: config.consider_offensive_same_map,
            consider_skirmishes_as_same_map: config.consider_skirmishes_as_same_map,
            allow_consecutive_offensives: config.allow_consecutive_offensives,
            allow_consecutive_offensives_opposite_sides: config
                .allow_consecutive_offensives_opposite_sides,
            allow_consecutive_skirmishes: config.allow_consecutive_skirmishes,
        }
    }
}

/// [`ExclusionRules`] resolved against one history and catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    layers: BTreeSet<String>,
    offensive_maps: BTreeSet<String>,
    control_maps: BTreeSet<String>,
    suppressed_modes: BTreeSet<GameMode>,
    disallowed_attackers: Option<Team>,
}

impl Exclusions {
    pub fn resolve(rules: &ExclusionRules, history: &HistorySnapshot, catalog: &[MapLayer]) -> Self {
        let Some((current, earlier)) = history.records().split_last() else {
            return Self::default();
        };
        let window = earlier.len().saturating_sub(rules.number_last_played_to_exclude);
        let recent = &earlier[window..];

        let layers: BTreeSet<String> = std::iter::once(current)
            .chain(recent)
            .filter_map(|record| record.layer_id().map(str::to_string))
            .collect();
        let recent_maps: BTreeSet<String> =
            recent.iter().map(|record| record.map().to_string()).collect();

        let mut exclusions = Self {
            layers,
            offensive_maps: if rules.consider_offensive_same_map {
                recent_maps.clone()
            } else {
                BTreeSet::new()
            },
            control_maps: if rules.consider_skirmishes_as_same_map {
                recent_maps
            } else {
                BTreeSet::new()
            },
            ..Self::default()
        };

        let current_layer = current
            .layer_id()
            .and_then(|id| catalog.iter().find(|layer| layer.id == id));
        match current_layer {
            Some(layer) if layer.game_mode == GameMode::Offensive => {
                if !rules.allow_consecutive_offensives {
                    exclusions.suppressed_modes.insert(GameMode::Offensive);
                } else if !rules.allow_consecutive_offensives_opposite_sides {
                    exclusions.disallowed_attackers = layer.attackers.map(Team::opponent);
                }
            }
            Some(layer) if layer.game_mode == GameMode::Control => {
                if !rules.allow_consecutive_skirmishes {
                    exclusions.suppressed_modes.insert(GameMode::Control);
                }
            }
            _ => {}
        }
        exclusions
    }

    pub fn permits(&self, layer: &MapLayer) -> bool {
        if self.layers.contains(&layer.id) || self.suppressed_modes.contains(&layer.game_mode) {
            return false;
        }
        match layer.game_mode {
            GameMode::Offensive => {
                !self.offensive_maps.contains(&layer.map)
                    && (self.disallowed_attackers.is_none()
                        || layer.attackers != self.disallowed_attackers)
            }
            GameMode::Control => !self.control_maps.contains(&layer.map),
            _ => true,
        }
    }

    /// `plan` without the game modes that may not follow the current round.
    pub fn restrict_plan(&self, plan: &SelectionPlan) -> SelectionPlan {
        let mut restricted = plan.clone();
        for &mode in &self.suppressed_modes {
            restricted.set(mode, 0);
        }
        restricted
    }

    pub fn suppressed_modes(&self) -> impl Iterator<Item = GameMode> + '_ {
        self.suppressed_modes.iter().copied()
    }
}
