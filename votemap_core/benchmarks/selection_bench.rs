use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use votemap_core::{
    select_plan, HistorySnapshot, PlayRecord, SelectionPlan, SelectionPolicy, WeightingParameters,
};
use votemap_runtime::{Environment, GameMode, MapLayer};

const MAPS: [&str; 18] = [
    "carentan",
    "omahabeach",
    "stmariedumont",
    "stmereeglise",
    "utahbeach",
    "elsenbornridge",
    "foy",
    "hill400",
    "hurtgenforest",
    "purpleheartlane",
    "kursk",
    "stalingrad",
    "driel",
    "elalamein",
    "kharkov",
    "mortain",
    "remagen",
    "tobruk",
];

fn synthetic_catalog(copies: usize) -> Vec<MapLayer> {
    let modes = [GameMode::Warfare, GameMode::Offensive, GameMode::Control];
    let mut catalog = Vec::new();
    for copy in 0..copies {
        for map in MAPS {
            for environment in Environment::ALL {
                for mode in modes {
                    catalog.push(MapLayer::new(
                        format!("{map}_{mode}_{environment}_{copy}"),
                        map,
                        environment,
                        mode,
                    ));
                }
            }
        }
    }
    catalog
}

fn bench_select_plan(c: &mut Criterion) {
    let params = WeightingParameters::builtin();
    let history = HistorySnapshot::from_records(
        MAPS.iter()
            .zip(Environment::ALL.iter().cycle())
            .enumerate()
            .map(|(round, (map, environment))| PlayRecord::new(*map, *environment, round as u64))
            .collect(),
        10,
    );
    let plan = SelectionPlan::standard();
    let mut group = c.benchmark_group("select_plan");

    for copies in [1usize, 4, 16] {
        let catalog = synthetic_catalog(copies);
        for normalize in [false, true] {
            let policy = SelectionPolicy {
                normalize_layer_counts: normalize,
                ..SelectionPolicy::default()
            };
            let label = if normalize { "normalized" } else { "plain" };
            group.bench_with_input(
                BenchmarkId::new(label, catalog.len()),
                &catalog,
                |b, catalog| {
                    let mut rng = ChaCha8Rng::seed_from_u64(42);
                    b.iter(|| {
                        select_plan(&params, &history, catalog, &plan, &policy, &mut rng)
                            .expect("synthetic catalog satisfies the plan")
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(selection_benches, bench_select_plan);
criterion_main!(selection_benches);
