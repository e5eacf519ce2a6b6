use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs,
    hash::Hash,
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

use schemars::{schema::RootSchema, schema_for, JsonSchema};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use votemap_runtime::{is_identifier, Environment};

pub const BUILTIN_WEIGHTING: &str = include_str!("data/weighting.json");

pub const MAX_GROUP_WEIGHT: i64 = 100;

/// Raw weighting document as operators write it.
///
/// Group order is preserved and duplicate group keys are kept so validation can
/// reject them instead of silently letting the last one win.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WeightingDocument {
    #[serde(deserialize_with = "ordered_entries")]
    #[schemars(with = "BTreeMap<String, MapGroupEntry>")]
    pub groups: Vec<(String, MapGroupEntry)>,
    #[serde(deserialize_with = "ordered_entries")]
    #[schemars(with = "BTreeMap<String, EnvironmentGroupEntry>")]
    pub environments: Vec<(String, EnvironmentGroupEntry)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MapGroupEntry {
    #[schemars(range(min = 0, max = 100))]
    pub weight: i64,
    #[schemars(range(min = 0, max = 1))]
    pub repeat_decay: f64,
    pub maps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentGroupEntry {
    #[schemars(range(min = 0, max = 100))]
    pub weight: i64,
    #[schemars(range(min = 0, max = 1))]
    pub repeat_decay: f64,
    pub environments: Vec<Environment>,
}

fn ordered_entries<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct EntriesVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an object of named groups")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(entry) = access.next_entry::<String, T>()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EntriesVisitor(PhantomData))
}

/// JSON Schema of the weighting document.
pub fn weighting_schema() -> RootSchema {
    schema_for!(WeightingDocument)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Map,
    Environment,
}

impl GroupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupKind::Map => "map",
            GroupKind::Environment => "environment",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to parse weighting parameters: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read weighting parameters from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("at least one {kind} group is required")]
    MissingGroups { kind: GroupKind },
    #[error("duplicate {kind} group `{group}`")]
    DuplicateGroup { kind: GroupKind, group: String },
    #[error(
        "{kind} group `{group}`: `{value}` is not a valid identifier (expected [A-Za-z0-9_], at most 50 characters)"
    )]
    InvalidIdentifier {
        kind: GroupKind,
        group: String,
        value: String,
    },
    #[error("{kind} group `{group}`: weight {weight} is outside 0..=100")]
    WeightOutOfRange {
        kind: GroupKind,
        group: String,
        weight: i64,
    },
    #[error("{kind} group `{group}`: repeat_decay {repeat_decay} is outside 0.0..=1.0")]
    RepeatDecayOutOfRange {
        kind: GroupKind,
        group: String,
        repeat_decay: f64,
    },
    #[error("{kind} `{member}` is listed in both `{first}` and `{second}`")]
    DuplicateMember {
        kind: GroupKind,
        member: String,
        first: String,
        second: String,
    },
}

/// A validated map or environment group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedGroup<M> {
    name: String,
    weight: u8,
    repeat_decay: f64,
    members: Vec<M>,
}

pub type MapGroup = WeightedGroup<String>;
pub type EnvironmentGroup = WeightedGroup<Environment>;

impl<M: PartialEq> WeightedGroup<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u8 {
        self.weight
    }

    pub fn repeat_decay(&self) -> f64 {
        self.repeat_decay
    }

    pub fn members(&self) -> &[M] {
        &self.members
    }

    pub fn contains(&self, member: &M) -> bool {
        self.members.contains(member)
    }
}

trait GroupEntry {
    type Member: Clone + Eq + Hash + fmt::Display;

    const KIND: GroupKind;

    fn weight(&self) -> i64;
    fn repeat_decay(&self) -> f64;
    fn into_members(self) -> Vec<Self::Member>;
    fn member_is_valid(member: &Self::Member) -> bool;
}

impl GroupEntry for MapGroupEntry {
    type Member = String;

    const KIND: GroupKind = GroupKind::Map;

    fn weight(&self) -> i64 {
        self.weight
    }

    fn repeat_decay(&self) -> f64 {
        self.repeat_decay
    }

    fn into_members(self) -> Vec<String> {
        self.maps
    }

    fn member_is_valid(member: &String) -> bool {
        is_identifier(member)
    }
}

impl GroupEntry for EnvironmentGroupEntry {
    type Member = Environment;

    const KIND: GroupKind = GroupKind::Environment;

    fn weight(&self) -> i64 {
        self.weight
    }

    fn repeat_decay(&self) -> f64 {
        self.repeat_decay
    }

    fn into_members(self) -> Vec<Environment> {
        self.environments
    }

    fn member_is_valid(_member: &Environment) -> bool {
        true
    }
}

type Resolved<M> = (Vec<WeightedGroup<M>>, HashMap<M, usize>);

fn resolve_groups<E: GroupEntry>(
    entries: Vec<(String, E)>,
) -> Result<Resolved<E::Member>, ConfigurationError> {
    let kind = E::KIND;
    if entries.is_empty() {
        return Err(ConfigurationError::MissingGroups { kind });
    }

    let mut groups: Vec<WeightedGroup<E::Member>> = Vec::with_capacity(entries.len());
    let mut owners: HashMap<E::Member, usize> = HashMap::new();

    for (name, entry) in entries {
        if !is_identifier(&name) {
            return Err(ConfigurationError::InvalidIdentifier {
                kind,
                group: name.clone(),
                value: name,
            });
        }
        if groups.iter().any(|group| group.name == name) {
            return Err(ConfigurationError::DuplicateGroup { kind, group: name });
        }
        let weight = entry.weight();
        let weight = match u8::try_from(weight) {
            Ok(value) if i64::from(value) <= MAX_GROUP_WEIGHT => value,
            _ => {
                return Err(ConfigurationError::WeightOutOfRange {
                    kind,
                    group: name,
                    weight,
                })
            }
        };
        let repeat_decay = entry.repeat_decay();
        if !(0.0..=1.0).contains(&repeat_decay) {
            return Err(ConfigurationError::RepeatDecayOutOfRange {
                kind,
                group: name,
                repeat_decay,
            });
        }

        let index = groups.len();
        let mut members = Vec::new();
        for member in entry.into_members() {
            if !E::member_is_valid(&member) {
                return Err(ConfigurationError::InvalidIdentifier {
                    kind,
                    group: name,
                    value: member.to_string(),
                });
            }
            match owners.get(&member) {
                Some(&owner) if owner == index => continue,
                Some(&owner) => {
                    return Err(ConfigurationError::DuplicateMember {
                        kind,
                        member: member.to_string(),
                        first: groups[owner].name.clone(),
                        second: name,
                    });
                }
                None => {
                    owners.insert(member.clone(), index);
                    members.push(member);
                }
            }
        }

        groups.push(WeightedGroup {
            name,
            weight,
            repeat_decay,
            members,
        });
    }

    Ok((groups, owners))
}

/// The validated aggregate of all map and environment groups.
#[derive(Debug, Clone)]
pub struct WeightingParameters {
    map_groups: Vec<MapGroup>,
    environment_groups: Vec<EnvironmentGroup>,
    map_owner: HashMap<String, usize>,
    environment_owner: HashMap<Environment, usize>,
}

impl WeightingParameters {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            WeightingParameters::from_json_str(BUILTIN_WEIGHTING)
                .expect("builtin weighting parameters should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let document: WeightingDocument = serde_json::from_str(json)?;
        WeightingParameters::from_document(document)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        WeightingParameters::from_json_str(&contents)
    }

    pub fn from_document(document: WeightingDocument) -> Result<Self, ConfigurationError> {
        let (map_groups, map_owner) = resolve_groups(document.groups)?;
        let (environment_groups, environment_owner) = resolve_groups(document.environments)?;
        Ok(Self {
            map_groups,
            environment_groups,
            map_owner,
            environment_owner,
        })
    }

    pub fn map_groups(&self) -> &[MapGroup] {
        &self.map_groups
    }

    pub fn environment_groups(&self) -> &[EnvironmentGroup] {
        &self.environment_groups
    }

    pub fn map_group_of(&self, map: &str) -> Option<&MapGroup> {
        self.map_owner.get(map).map(|&index| &self.map_groups[index])
    }

    pub fn environment_group_of(&self, environment: Environment) -> Option<&EnvironmentGroup> {
        self.environment_owner
            .get(&environment)
            .map(|&index| &self.environment_groups[index])
    }

    pub fn map_group(&self, name: &str) -> Option<&MapGroup> {
        self.map_groups.iter().find(|group| group.name == name)
    }

    pub fn environment_group(&self, name: &str) -> Option<&EnvironmentGroup> {
        self.environment_groups
            .iter()
            .find(|group| group.name == name)
    }
}
