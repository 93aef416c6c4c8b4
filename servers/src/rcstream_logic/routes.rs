//! Demo routes wired into the server: a category watcher and a per-wiki
//! edit counter. Both tolerate replayed events after a reconnect.

use anyhow::{Context, Result};
use lib_common::core::{CategoryChange, ChangeEvent, RouteSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const CATEGORY_PREFIX: &str = "Category:";
/// Event keys remembered for de-duplication.
const DEDUP_WINDOW: usize = 50_000;

pub fn build_routes(categories: Vec<String>, counter: Arc<EditCounter>) -> Vec<RouteSpec> {
    vec![category_watcher(categories), edit_counter(counter)]
}

fn normalize_category(name: &str) -> String {
    let name = name.trim();
    if name.starts_with(CATEGORY_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", CATEGORY_PREFIX, name)
    }
}

/// Logs membership changes of the watched categories. An empty list watches all of them.
pub fn category_watcher(categories: Vec<String>) -> RouteSpec {
    let watched: Arc<HashSet<String>> = Arc::new(categories.iter().map(|c| normalize_category(c)).collect());
    let filter_set = Arc::clone(&watched);

    RouteSpec::new("category_watcher")
        .filter(move |ev| ev.is_categorize() && (filter_set.is_empty() || filter_set.contains(&ev.title)))
        .init(move || {
            let watched = Arc::clone(&watched);
            async move {
                if watched.is_empty() {
                    log::info!("Category watcher: watching every category");
                } else {
                    let mut names: Vec<_> = watched.iter().cloned().collect();
                    names.sort();
                    log::info!("Category watcher: watching {}", names.join(", "));
                }
                Ok(())
            }
        })
        .worker(|ev| async move {
            match ev.category_change() {
                Some(CategoryChange::Added(page)) => {
                    log::info!("[{}] {} added to {} by {}", ev.wiki, page, ev.title, ev.user)
                }
                Some(CategoryChange::Removed(page)) => {
                    log::info!("[{}] {} removed from {} by {}", ev.wiki, page, ev.title, ev.user)
                }
                None => log::debug!("[{}] {} changed: {}", ev.wiki, ev.title, ev.comment),
            }
            Ok(())
        })
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterState {
    counts: BTreeMap<String, u64>,
    recent: VecDeque<String>,
}

/// # Edit Counter
///
/// Counts edits and page creations per wiki. Each event is counted once,
/// keyed by `ChangeEvent::dedup_key`, within a bounded window of recent keys
/// that is saved alongside the counts.
pub struct EditCounter {
    path: PathBuf,
    state: Mutex<CounterState>,
    recent_set: Mutex<HashSet<String>>,
}

impl EditCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(CounterState::default()),
            recent_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counts `ev` unless it was already seen. Returns `true` when counted.
    pub fn record(&self, ev: &ChangeEvent) -> bool {
        let key = ev.dedup_key();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen = self.recent_set.lock().unwrap_or_else(PoisonError::into_inner);

        if !seen.insert(key.clone()) {
            log::debug!("Edit counter: {} already counted", key);
            return false;
        }
        state.recent.push_back(key);
        while state.recent.len() > DEDUP_WINDOW {
            if let Some(old) = state.recent.pop_front() {
                seen.remove(&old);
            }
        }
        *state.counts.entry(ev.wiki.clone()).or_default() += 1;
        true
    }

    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).counts.clone()
    }

    /// Restores the last snapshot. A missing file starts from zero.
    pub async fn load(&self) -> Result<()> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Edit counter: no snapshot at {}, starting empty", self.path.display());
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        };
        let loaded: CounterState =
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", self.path.display()))?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen = self.recent_set.lock().unwrap_or_else(PoisonError::into_inner);
        *seen = loaded.recent.iter().cloned().collect();
        *state = loaded;
        log::info!(
            "Edit counter: restored {} wiki(s) from {}",
            state.counts.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Writes the snapshot (write-then-rename).
    pub async fn save(&self) -> Result<()> {
        let json = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string(&*state)?
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Route feeding `counter`. Its `init` restores the previous snapshot.
pub fn edit_counter(counter: Arc<EditCounter>) -> RouteSpec {
    let init_counter = Arc::clone(&counter);

    RouteSpec::new("edit_counter")
        .filter(|ev| matches!(ev.kind.as_str(), "edit" | "new"))
        .init(move || {
            let counter = Arc::clone(&init_counter);
            async move { counter.load().await }
        })
        .worker(move |ev| {
            let counter = Arc::clone(&counter);
            async move {
                counter.record(&ev);
                Ok(())
            }
        })
}
