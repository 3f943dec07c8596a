//! # Mapping file store
//!
//! The concrete stand-in for the external mapping-store collaborator: a
//! JSON file holding the current `Vec<PortMapping>`, watched for changes so
//! the session loop can push a fresh `ConfigSync` without waiting for the
//! next reconnect.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tunnel_protocol::PortMapping;

use crate::error::AgentError;

/// Many editors and config-management tools touch a file more than once per
/// logical write (write-then-rename, or several small appends); this is the
/// quiet period after the last observed event before a reload actually runs.
const DEBOUNCE: Duration = Duration::from_millis(200);

pub struct FileMappingStore {
    _watcher: RecommendedWatcher,
}

impl FileMappingStore {
    /// Loads the mapping file once and starts watching it for changes.
    /// Returns the store (which must be kept alive for the watch to keep
    /// running) and a `watch::Receiver` carrying the current mapping set.
    pub fn open(path: PathBuf) -> Result<(Self, watch::Receiver<Vec<PortMapping>>), AgentError> {
        let initial = load_and_sanitize(&path)?;
        let (tx, rx) = watch::channel(initial);

        let watch_path = path.clone();
        let generation = Arc::new(AtomicU64::new(0));

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res
        {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                let this_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
                let watch_path = watch_path.clone();
                let tx = tx.clone();
                let generation = generation.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(DEBOUNCE).await;
                    if generation.load(Ordering::SeqCst) != this_generation {
                        // A later event arrived during the quiet period;
                        // that one's own task will do the reload instead.
                        return;
                    }
                    match load_and_sanitize(&watch_path) {
                        Ok(mappings) => {
                            let _ = tx.send(mappings);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to reload mapping file after change")
                        }
                    }
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "mapping file watcher error"),
        })
        .map_err(|e| AgentError::MappingStore(e.to_string()))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| AgentError::MappingStore(e.to_string()))?;

        Ok((Self { _watcher: watcher }, rx))
    }
}

fn load(path: &Path) -> Result<Vec<PortMapping>, AgentError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| AgentError::MappingStore(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| AgentError::MappingStore(format!("parsing {}: {e}", path.display())))
}

/// Loads the file and drops any mapping that fails validation (or collides
/// on `externalDomain` with one already kept), logging each drop. The rest
/// of the set is still published — a single bad entry in the file shouldn't
/// block every other route from syncing.
fn load_and_sanitize(path: &Path) -> Result<Vec<PortMapping>, AgentError> {
    let mappings = load(path)?;
    let (valid, rejected) = tunnel_protocol::mapping::sanitize(&mappings);
    for (mapping, e) in &rejected {
        tracing::warn!(
            domain = %mapping.external_domain,
            error = %e,
            "dropping invalid mapping from the mapping file"
        );
    }
    Ok(valid)
}
