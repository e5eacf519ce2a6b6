use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use serde_json::json;
use votemap_core::{
    score_catalog, select_plan, weighting_schema, ExclusionRules, HistorySnapshot, PlayRecord,
    SelectionPlan, SelectionPolicy, WeightingParameters, DEFAULT_HISTORY_RETENTION,
    DEFAULT_RECENCY_HORIZON,
};
use votemap_runtime::{catalog_from_json, GameMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Offline votemap selection preview", long_about = None)]
struct Args {
    /// Weighting parameters JSON (defaults to the built-in groups)
    #[arg(long)]
    weighting: Option<PathBuf>,

    /// Layer catalog dump, either the api/get_maps envelope or a bare array
    #[arg(long, required_unless_present = "print_schema")]
    catalog: Option<PathBuf>,

    /// Play history JSON, a list of records oldest first
    #[arg(long)]
    history: Option<PathBuf>,

    /// Options per game mode (format: mode=count); defaults to the standard plan
    #[arg(long = "option")]
    options: Vec<String>,

    /// Rounds after which a recent play stops suppressing a group
    #[arg(long, default_value_t = DEFAULT_RECENCY_HORIZON)]
    horizon: u32,

    /// History window used for recency
    #[arg(long, default_value_t = DEFAULT_HISTORY_RETENTION)]
    retention: usize,

    /// Seed for a reproducible draw
    #[arg(long)]
    seed: Option<u64>,

    /// Divide scores by the number of layers sharing a map or environment
    #[arg(long)]
    normalize: bool,

    /// Rounds before the current one whose layers are left out
    #[arg(long)]
    exclude_last: Option<usize>,

    /// Offer anything in the catalog regardless of recent layers and modes
    #[arg(long, conflicts_with = "exclude_last")]
    no_exclusions: bool,

    /// Print every eligible layer with its score instead of drawing
    #[arg(long)]
    scores: bool,

    /// Print the weighting parameters JSON schema and exit
    #[arg(long)]
    print_schema: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Snapshot(HistorySnapshot),
    Records(Vec<PlayRecord>),
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_schema {
        println!("{}", serde_json::to_string_pretty(&weighting_schema())?);
        return Ok(());
    }

    let parameters = match &args.weighting {
        Some(path) => Arc::new(
            WeightingParameters::from_file(path)
                .with_context(|| format!("Failed to load weighting from {}", path.display()))?,
        ),
        None => WeightingParameters::builtin(),
    };

    let catalog_path = args
        .catalog
        .as_deref()
        .ok_or_else(|| anyhow!("--catalog is required"))?;
    let catalog_json = fs::read_to_string(catalog_path)
        .with_context(|| format!("Failed to read catalog at {}", catalog_path.display()))?;
    let catalog = catalog_from_json(&catalog_json)
        .with_context(|| format!("Failed to parse catalog at {}", catalog_path.display()))?;

    let history = match &args.history {
        Some(path) => load_history(path, args.retention)?,
        None => HistorySnapshot::default(),
    };
    let mut exclusions = if args.no_exclusions {
        ExclusionRules::none()
    } else {
        ExclusionRules::default()
    };
    if let Some(rounds) = args.exclude_last {
        exclusions.number_last_played_to_exclude = rounds;
    }
    let policy = SelectionPolicy {
        recency_horizon: args.horizon,
        normalize_layer_counts: args.normalize,
        exclusions,
    };

    if args.scores {
        let pool = score_catalog(&parameters, &history, &catalog, &policy);
        println!("{}", serde_json::to_string_pretty(&pool)?);
        return Ok(());
    }

    let plan = parse_plan(&args.options)?;
    let mut rng = match args.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let selection = select_plan(&parameters, &history, &catalog, &plan, &policy, &mut rng)
        .with_context(|| "Selection failed")?;

    let output = json!({
        "catalog_layers": catalog.len(),
        "history_rounds": history.len(),
        "plan": plan,
        "selection": selection,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_history(path: &Path, retention: usize) -> Result<HistorySnapshot> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read history at {}", path.display()))?;
    let records = match serde_json::from_str::<HistoryFile>(&data)
        .with_context(|| format!("Failed to parse history at {}", path.display()))?
    {
        HistoryFile::Snapshot(snapshot) => snapshot.records().to_vec(),
        HistoryFile::Records(records) => records,
    };
    Ok(HistorySnapshot::from_records(records, retention.max(1)))
}

fn parse_plan(raw_options: &[String]) -> Result<SelectionPlan> {
    if raw_options.is_empty() {
        return Ok(SelectionPlan::standard());
    }
    let mut plan = SelectionPlan::new();
    for raw in raw_options {
        let (mode, count) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("Option must be in mode=count form, got '{raw}'"))?;
        let mode: GameMode = mode
            .trim()
            .parse()
            .with_context(|| format!("Unknown game mode in '{raw}'"))?;
        let count: usize = count
            .trim()
            .parse()
            .with_context(|| format!("Invalid option count in '{raw}'"))?;
        plan.set(mode, count);
    }
    Ok(plan)
}
