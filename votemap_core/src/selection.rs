//! Weighted, recency-aware choice of vote candidates.
//!
//! A layer's score is the product of its map group's and environment group's
//! weight, each scaled by a decay multiplier that suppresses groups played
//! within the recency horizon. Candidates are then drawn without replacement,
//! re-normalising over the remaining pool after every draw.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use rand::distributions::{Distribution, WeightedError, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use votemap_runtime::{Environment, GameMode, MapLayer, VotemapUserConfig};

use crate::exclusions::{ExclusionRules, Exclusions};
use crate::history::{HistorySnapshot, Recency};
use crate::weighting::{GroupKind, WeightingParameters};

/// Roughly one rotation of the default option set.
pub const DEFAULT_RECENCY_HORIZON: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub recency_horizon: u32,
    /// Divide each score by the number of pool layers sharing its map and its
    /// environment.
    pub normalize_layer_counts: bool,
    /// Applied by [`select_plan`] before scoring.
    #[serde(default)]
    pub exclusions: ExclusionRules,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            recency_horizon: DEFAULT_RECENCY_HORIZON,
            normalize_layer_counts: false,
            exclusions: ExclusionRules::default(),
        }
    }
}

/// `1 - repeat_decay * (1 - recency / horizon)` inside the horizon, `1`
/// otherwise.
pub fn decay_multiplier(repeat_decay: f64, recency: Recency, horizon: u32) -> f64 {
    match recency {
        Recency::Never => 1.0,
        Recency::Rounds(rounds) if rounds >= u64::from(horizon) => 1.0,
        Recency::Rounds(rounds) => {
            1.0 - repeat_decay * (1.0 - rounds as f64 / f64::from(horizon))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredLayer {
    pub layer: MapLayer,
    pub score: f64,
}

/// Drawn candidates in draw order with the score each had before drawing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectionResult {
    candidates: Vec<ScoredLayer>,
}

impl SelectionResult {
    pub fn candidates(&self) -> &[ScoredLayer] {
        &self.candidates
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|candidate| candidate.layer.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn into_candidates(self) -> Vec<ScoredLayer> {
        self.candidates
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    #[error("the layer catalog is empty")]
    EmptyCatalog,
    #[error(
        "{requested} options requested{} but only {eligible} layers are eligible",
        ModeSuffix(.game_mode)
    )]
    InsufficientCandidates {
        game_mode: Option<GameMode>,
        requested: usize,
        eligible: usize,
    },
    #[error("the selection plan requests no options")]
    EmptyPlan,
    #[error("weighted sampling failed: {0}")]
    Sampling(#[from] WeightedError),
}

struct ModeSuffix<'a>(&'a Option<GameMode>);

impl fmt::Display for ModeSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(mode) => write!(f, " for {mode}"),
            None => Ok(()),
        }
    }
}

/// Number of options to draw per game mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionPlan {
    counts: BTreeMap<GameMode, usize>,
}

impl SelectionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Four warfare, two offensive and one control option.
    pub fn standard() -> Self {
        Self::new()
            .with(GameMode::Warfare, 4)
            .with(GameMode::Offensive, 2)
            .with(GameMode::Control, 1)
    }

    pub fn with(mut self, mode: GameMode, count: usize) -> Self {
        self.set(mode, count);
        self
    }

    pub fn set(&mut self, mode: GameMode, count: usize) {
        self.counts.insert(mode, count);
    }

    pub fn count_for(&self, mode: GameMode) -> usize {
        self.counts.get(&mode).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (GameMode, usize)> + '_ {
        self.counts
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&mode, &count)| (mode, count))
    }
}

/// Option counts configured on the remote tool. Its skirmish options are
/// control layers.
impl From<&VotemapUserConfig> for SelectionPlan {
    fn from(config: &VotemapUserConfig) -> Self {
        Self::new()
            .with(GameMode::Warfare, config.num_warfare_options)
            .with(GameMode::Offensive, config.num_offensive_options)
            .with(GameMode::Control, config.num_skirmish_control_options)
    }
}

/// Draws `count` distinct layers from `catalog`.
pub fn select<R: Rng + ?Sized>(
    parameters: &WeightingParameters,
    history: &HistorySnapshot,
    catalog: &[MapLayer],
    count: usize,
    policy: &SelectionPolicy,
    rng: &mut R,
) -> Result<SelectionResult, SelectionError> {
    if catalog.is_empty() {
        return Err(SelectionError::EmptyCatalog);
    }
    let pool = score_catalog(parameters, history, catalog, policy);
    draw(pool, count, None, rng)
}

/// Draws each game mode's share of `plan` from the matching part of the
/// catalog and concatenates the results in game-mode order.
///
/// The policy's exclusion rules run first: layers they rule out are never
/// scored, and a game mode that may not follow the current round draws
/// nothing.
pub fn select_plan<R: Rng + ?Sized>(
    parameters: &WeightingParameters,
    history: &HistorySnapshot,
    catalog: &[MapLayer],
    plan: &SelectionPlan,
    policy: &SelectionPolicy,
    rng: &mut R,
) -> Result<SelectionResult, SelectionError> {
    if catalog.is_empty() {
        return Err(SelectionError::EmptyCatalog);
    }
    if plan.is_empty() {
        return Err(SelectionError::EmptyPlan);
    }

    let exclusions = Exclusions::resolve(&policy.exclusions, history, catalog);
    let plan = exclusions.restrict_plan(plan);
    if plan.is_empty() {
        return Err(SelectionError::EmptyPlan);
    }
    let eligible: Vec<MapLayer> = catalog
        .iter()
        .filter(|layer| exclusions.permits(layer))
        .cloned()
        .collect();
    if eligible.len() < catalog.len() {
        debug!(
            target: "votemap::selection",
            excluded = catalog.len() - eligible.len(),
            suppressed_modes = ?exclusions.suppressed_modes().collect::<Vec<_>>(),
            "selection.exclusions_applied"
        );
    }

    let scored = score_catalog(parameters, history, &eligible, policy);
    let mut candidates = Vec::with_capacity(plan.total());
    for (mode, count) in plan.iter() {
        let pool: Vec<ScoredLayer> = scored
            .iter()
            .filter(|candidate| candidate.layer.game_mode == mode)
            .cloned()
            .collect();
        let drawn = draw(pool, count, Some(mode), rng)?;
        candidates.extend(drawn.candidates);
    }

    let result = SelectionResult { candidates };
    debug!(
        target: "votemap::selection",
        layers = ?result.layer_ids(),
        "selection.drawn"
    );
    Ok(result)
}

/// Scores every eligible layer. Layers are de-duplicated by id and returned in
/// id order; those without a map or environment group, or with a
/// non-positive score, are left out.
///
/// The map axis decays with the rounds since that particular map was played,
/// using its group's `repeat_decay`. The environment axis decays with the
/// rounds since any environment of the group was played.
pub fn score_catalog(
    parameters: &WeightingParameters,
    history: &HistorySnapshot,
    catalog: &[MapLayer],
    policy: &SelectionPolicy,
) -> Vec<ScoredLayer> {
    let horizon = policy.recency_horizon;
    let mut map_decay: HashMap<&str, f64> = HashMap::new();
    let environment_decay: HashMap<&str, f64> = parameters
        .environment_groups()
        .iter()
        .map(|group| {
            let recency = history.recency_of(parameters, group.name(), GroupKind::Environment);
            (group.name(), decay_multiplier(group.repeat_decay(), recency, horizon))
        })
        .collect();

    let mut layers: Vec<&MapLayer> = catalog.iter().collect();
    layers.sort_by(|a, b| a.id.cmp(&b.id));
    layers.dedup_by(|a, b| a.id == b.id);

    let mut unconfigured_maps = BTreeSet::new();
    let mut unconfigured_environments = BTreeSet::new();
    let mut grouped = Vec::with_capacity(layers.len());
    for layer in layers {
        let map_group = parameters.map_group_of(&layer.map);
        let environment_group = parameters.environment_group_of(layer.environment);
        if map_group.is_none() {
            unconfigured_maps.insert(layer.map.as_str());
        }
        if environment_group.is_none() {
            unconfigured_environments.insert(layer.environment);
        }
        if let (Some(map_group), Some(environment_group)) = (map_group, environment_group) {
            let map_factor = *map_decay.entry(layer.map.as_str()).or_insert_with(|| {
                let recency = history.recency_of_map(&layer.map);
                decay_multiplier(map_group.repeat_decay(), recency, horizon)
            });
            let score = f64::from(map_group.weight())
                * map_factor
                * f64::from(environment_group.weight())
                * environment_decay[environment_group.name()];
            grouped.push((layer, score));
        }
    }

    if !unconfigured_maps.is_empty() || !unconfigured_environments.is_empty() {
        warn!(
            target: "votemap::selection",
            maps = ?unconfigured_maps,
            environments = ?unconfigured_environments,
            "selection.unconfigured_excluded"
        );
    }

    let (map_counts, environment_counts) = if policy.normalize_layer_counts {
        layer_counts(grouped.iter().map(|(layer, _)| *layer))
    } else {
        (HashMap::new(), HashMap::new())
    };

    grouped
        .into_iter()
        .filter_map(|(layer, mut score)| {
            if policy.normalize_layer_counts {
                let maps = map_counts[&(layer.game_mode, layer.map.as_str())];
                let environments = environment_counts[&(layer.game_mode, layer.environment)];
                score /= (maps * environments) as f64;
            }
            (score > 0.0 && score.is_finite()).then(|| ScoredLayer {
                layer: layer.clone(),
                score,
            })
        })
        .collect()
}

type LayerCounts<'a> = (
    HashMap<(GameMode, &'a str), usize>,
    HashMap<(GameMode, Environment), usize>,
);

// counted per game mode since each mode is drawn from its own pool
fn layer_counts<'a>(layers: impl Iterator<Item = &'a MapLayer>) -> LayerCounts<'a> {
    let mut maps = HashMap::new();
    let mut environments = HashMap::new();
    for layer in layers {
        *maps.entry((layer.game_mode, layer.map.as_str())).or_insert(0) += 1;
        *environments
            .entry((layer.game_mode, layer.environment))
            .or_insert(0) += 1;
    }
    (maps, environments)
}

fn draw<R: Rng + ?Sized>(
    mut pool: Vec<ScoredLayer>,
    count: usize,
    game_mode: Option<GameMode>,
    rng: &mut R,
) -> Result<SelectionResult, SelectionError> {
    if pool.len() < count {
        return Err(SelectionError::InsufficientCandidates {
            game_mode,
            requested: count,
            eligible: pool.len(),
        });
    }

    let mut candidates = Vec::with_capacity(count);
    for _ in 0..count {
        let index = WeightedIndex::new(pool.iter().map(|candidate| candidate.score))?.sample(rng);
        candidates.push(pool.remove(index));
    }
    Ok(SelectionResult { candidates })
}
