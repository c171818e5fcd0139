//! Plugin descriptor catalog.
//!
//! Scanning walks directories for candidate binaries and asks a [`Prober`]
//! for each one's descriptor. Probing runs untrusted code, so the default
//! prober does it in a `cuehost-probe` subprocess.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cuehost_engine::builtin;
use cuehost_isolation::{ProbeRunner, native};
use cuehost_plugin::{PluginDescriptor, PluginError, PluginFormat};
use parking_lot::RwLock;

/// Deepest directory level a scan descends to
const MAX_DEPTH: usize = 8;

/// Turns one candidate binary into a descriptor.
pub trait Prober: Send + Sync {
    fn probe(&self, path: &Path, format: PluginFormat) -> Result<PluginDescriptor, PluginError>;
}

/// Probes each candidate in its own `cuehost-probe` process.
pub struct SubprocessProber(pub ProbeRunner);

impl Prober for SubprocessProber {
    fn probe(&self, path: &Path, format: PluginFormat) -> Result<PluginDescriptor, PluginError> {
        self.0.probe(path, format).map_err(PluginError::from)
    }
}

/// Probes inside the host process. A crashing binary takes the host down.
pub struct InProcessProber;

impl Prober for InProcessProber {
    fn probe(&self, path: &Path, format: PluginFormat) -> Result<PluginDescriptor, PluginError> {
        native::probe(path, format)
    }
}

/// Find candidate plugin binaries below `paths`.
///
/// Missing or unreadable directories contribute nothing. A path that is
/// itself a plugin is returned as-is.
pub fn discover(paths: &[PathBuf]) -> Vec<(PathBuf, PluginFormat)> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    for path in paths {
        if let Some(format) = PluginFormat::from_path(path)
            && path.exists()
        {
            found.push((path.clone(), format));
            continue;
        }
        walk(path, 0, &mut visited, &mut found);
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found.dedup_by(|a, b| a.0 == b.0);
    found
}

fn walk(
    dir: &Path,
    depth: usize,
    visited: &mut HashSet<PathBuf>,
    found: &mut Vec<(PathBuf, PluginFormat)>,
) {
    if depth > MAX_DEPTH {
        tracing::debug!("Scan depth limit reached at {}", dir.display());
        return;
    }
    // Canonical paths break symlink cycles.
    let Ok(canonical) = dir.canonicalize() else {
        return;
    };
    if !visited.insert(canonical) {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Skipping {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(format) = PluginFormat::from_path(&path) {
            // Bundles are leaves: their contents belong to the plugin.
            found.push((path, format));
        } else if path.is_dir() {
            walk(&path, depth + 1, visited, found);
        }
    }
}

/// In-memory catalog of known plugins, keyed by descriptor id.
pub struct Catalog {
    entries: RwLock<HashMap<String, Arc<PluginDescriptor>>>,
    prober: Box<dyn Prober>,
}

impl Catalog {
    /// Create a catalog, pre-populated with the builtin plugins if asked.
    pub fn new(prober: Box<dyn Prober>, include_builtins: bool) -> Self {
        let catalog = Self {
            entries: RwLock::new(HashMap::new()),
            prober,
        };
        if include_builtins {
            for descriptor in builtin::descriptors() {
                catalog.insert(descriptor);
            }
        }
        catalog
    }

    /// Scan `paths` and merge the results.
    ///
    /// Candidates that fail to probe are logged and left out. Scanned
    /// descriptors replace entries with the same id; everything else stays.
    pub fn scan(&self, paths: &[PathBuf]) -> Vec<PluginDescriptor> {
        let candidates = discover(paths);
        tracing::info!(
            "Scanning {} candidate(s) in {} path(s)",
            candidates.len(),
            paths.len()
        );

        let mut scanned = Vec::with_capacity(candidates.len());
        for (path, format) in candidates {
            match self.prober.probe(&path, format) {
                Ok(descriptor) => {
                    tracing::debug!("Found {} ({})", descriptor.name, descriptor.id);
                    scanned.push(descriptor);
                }
                Err(e) => tracing::warn!("Skipping {}: {e}", path.display()),
            }
        }

        let mut entries = self.entries.write();
        for descriptor in &scanned {
            entries.insert(descriptor.id.clone(), Arc::new(descriptor.clone()));
        }
        tracing::info!("Scan found {} plugin(s), catalog has {}", scanned.len(), entries.len());
        scanned
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.entries.read().get(id).cloned()
    }

    /// Every known descriptor, sorted by id.
    pub fn list(&self) -> Vec<PluginDescriptor> {
        let mut all: Vec<PluginDescriptor> = self
            .entries
            .read()
            .values()
            .map(|d| PluginDescriptor::clone(d))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn insert(&self, descriptor: PluginDescriptor) {
        self.entries
            .write()
            .insert(descriptor.id.clone(), Arc::new(descriptor));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
