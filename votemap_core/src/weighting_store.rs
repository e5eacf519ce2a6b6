use std::{
    env,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::weighting::{ConfigurationError, WeightingParameters};

/// One immutable generation of the weighting parameters.
#[derive(Debug)]
pub struct VersionedWeighting {
    version: u64,
    parameters: Arc<WeightingParameters>,
    source: Option<PathBuf>,
}

impl VersionedWeighting {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn parameters(&self) -> &Arc<WeightingParameters> {
        &self.parameters
    }

    /// File the parameters were loaded from; `None` for the builtin document
    /// or parameters supplied directly.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Holds the active weighting parameters.
///
/// Every replacement installs a whole new validated generation, so readers
/// never observe a partially updated set. A failed load leaves the previous
/// generation active.
#[derive(Debug)]
pub struct WeightingStore {
    current: RwLock<Arc<VersionedWeighting>>,
}

impl WeightingStore {
    pub fn new(parameters: Arc<WeightingParameters>, source: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(VersionedWeighting {
                version: 1,
                parameters,
                source,
            })),
        }
    }

    pub fn builtin() -> Self {
        Self::new(WeightingParameters::builtin(), None)
    }

    pub fn current(&self) -> Arc<VersionedWeighting> {
        Arc::clone(&self.current.read().expect("weighting store lock poisoned"))
    }

    pub fn replace(
        &self,
        parameters: Arc<WeightingParameters>,
        source: Option<PathBuf>,
    ) -> Arc<VersionedWeighting> {
        let mut guard = self.current.write().expect("weighting store lock poisoned");
        let next = Arc::new(VersionedWeighting {
            version: guard.version + 1,
            parameters,
            source,
        });
        *guard = Arc::clone(&next);
        drop(guard);
        info!(
            target: "votemap::config",
            version = next.version,
            source = ?next.source,
            "weighting.replaced"
        );
        next
    }

    /// Validates `json` and installs it, keeping the current source path.
    pub fn replace_from_str(&self, json: &str) -> Result<Arc<VersionedWeighting>, ConfigurationError> {
        let source = self.current().source.clone();
        match WeightingParameters::from_json_str(json) {
            Ok(parameters) => Ok(self.replace(Arc::new(parameters), source)),
            Err(err) => {
                warn!(
                    target: "votemap::config",
                    error = %err,
                    "weighting.replace_rejected"
                );
                Err(err)
            }
        }
    }

    pub fn reload_from(&self, path: &Path) -> Result<Arc<VersionedWeighting>, ConfigurationError> {
        match WeightingParameters::from_file(path) {
            Ok(parameters) => Ok(self.replace(Arc::new(parameters), Some(path.to_path_buf()))),
            Err(err) => {
                warn!(
                    target: "votemap::config",
                    path = %path.display(),
                    error = %err,
                    "weighting.reload_failed"
                );
                Err(err)
            }
        }
    }

    /// Re-reads the current source file. Parameters without a backing file
    /// are left untouched.
    pub fn reload(&self) -> Result<Arc<VersionedWeighting>, ConfigurationError> {
        let current = self.current();
        match current.source.as_deref() {
            Some(path) => self.reload_from(path),
            None => {
                info!(
                    target: "votemap::config",
                    version = current.version,
                    "weighting.reload_skipped=no_source"
                );
                Ok(current)
            }
        }
    }

    /// Reloads whenever the backing file is created or modified. The watcher
    /// stops when the returned handle is dropped.
    pub fn watch(self: &Arc<Self>) -> Result<Option<RecommendedWatcher>, notify::Error> {
        let Some(path) = self.current().source.clone() else {
            return Ok(None);
        };
        let file_name = path.file_name().map(|name| name.to_os_string());
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let store = Arc::downgrade(self);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    if !event
                        .paths
                        .iter()
                        .any(|changed| changed.file_name() == file_name.as_deref())
                    {
                        return;
                    }
                    if let Some(store) = store.upgrade() {
                        // failures are logged and the previous generation stays active
                        let _ = store.reload();
                    }
                }
                Err(err) => {
                    warn!(target: "votemap::config", error = %err, "weighting.watch_error");
                }
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(
            target: "votemap::config",
            path = %path.display(),
            "weighting.watching"
        );
        Ok(Some(watcher))
    }
}

/// Loads the weighting store from `WEIGHTING_CONFIG_PATH`, else `fallback`,
/// else the builtin document.
///
/// A configured file that fails to load still becomes the store's source, so
/// fixing it on disk is picked up by the watcher or the next reload.
pub fn load_weighting_from_env(fallback: Option<&Path>) -> WeightingStore {
    let configured = env::var("WEIGHTING_CONFIG_PATH")
        .ok()
        .map(PathBuf::from)
        .or_else(|| fallback.map(Path::to_path_buf));
    match configured {
        Some(path) => load_weighting_file(path),
        None => {
            info!(target: "votemap::config", "weighting.loaded=builtin");
            WeightingStore::builtin()
        }
    }
}

fn load_weighting_file(path: PathBuf) -> WeightingStore {
    match WeightingParameters::from_file(&path) {
        Ok(parameters) => {
            info!(
                target: "votemap::config",
                path = %path.display(),
                "weighting.loaded=file"
            );
            WeightingStore::new(Arc::new(parameters), Some(path))
        }
        Err(err) => {
            warn!(
                target: "votemap::config",
                path = %path.display(),
                error = %err,
                "weighting.load_failed"
            );
            info!(
                target: "votemap::config",
                path = %path.display(),
                "weighting.loaded=builtin_until_reload"
            );
            WeightingStore::new(WeightingParameters::builtin(), Some(path))
        }
    }
}
