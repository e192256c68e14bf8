//! Rule storage with swap-not-mutate reloads.
//!
//! Readers take a cheap snapshot of the current [`RuleSet`] and keep using it
//! for the whole lookup. A rebuild compiles a brand-new set off the async
//! runtime and installs it with a single pointer swap.
//!
//! Background rebuilds go through a single-slot channel: a request made while
//! another is pending replaces it, so only the latest list generation is built.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;
use sift_metrics::FilterMetrics;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::lists::FilterList;
use crate::table::RuleSet;
use crate::{FilterError, Result};

type PendingLists = Option<Arc<Vec<FilterList>>>;

/// Holds the active rule set.
pub struct RuleStorage {
    current: ArcSwap<RuleSet>,
    generation: watch::Sender<u64>,
    worker: OnceCell<watch::Sender<PendingLists>>,
    metrics: FilterMetrics,
}

impl RuleStorage {
    /// Creates storage holding an empty rule set.
    pub fn new(metrics: FilterMetrics) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(RuleSet::new()),
            generation,
            worker: OnceCell::new(),
            metrics,
        }
    }

    /// Returns a snapshot of the active rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Number of rule sets installed so far.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Subscribes to installs; the value is the generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Compiles lists into a new rule set.
    ///
    /// A list that cannot be read is logged and skipped.
    pub fn build(lists: &[FilterList]) -> RuleSet {
        let mut set = RuleSet::new();
        for list in lists {
            match list.read() {
                Ok(text) => {
                    set.add_text(&text, list.id);
                }
                Err(e) => warn!(list_id = list.id, error = %e, "Cannot read filter list"),
            }
        }
        set
    }

    /// Installs a rule set, replacing the active one.
    pub fn install(&self, set: RuleSet) {
        let rules = set.len();
        self.current.store(Arc::new(set));
        self.generation.send_modify(|g| *g += 1);
        self.metrics.set_rules_loaded(rules);
        info!(rules, generation = self.generation(), "Rule set installed");
    }

    /// Rebuilds from `lists` and installs the result.
    ///
    /// Compilation runs on the blocking pool; lookups keep using the previous
    /// set until it finishes. Returns the number of rules loaded.
    pub async fn rebuild(&self, lists: Arc<Vec<FilterList>>) -> Result<usize> {
        let start = Instant::now();
        let set = tokio::task::spawn_blocking(move || Self::build(&lists))
            .await
            .map_err(|_| FilterError::WorkerStopped)?;
        let rules = set.len();
        self.install(set);
        self.metrics.record_reload(start.elapsed());
        Ok(rules)
    }

    /// Queues a background rebuild, superseding any request not yet started.
    ///
    /// The worker is spawned on first use and must run inside a Tokio runtime.
    pub fn request_rebuild(self: &Arc<Self>, lists: Vec<FilterList>) -> Result<()> {
        let sender = self.worker.get_or_init(|| self.spawn_worker());
        sender
            .send(Some(Arc::new(lists)))
            .map_err(|_| FilterError::WorkerStopped)
    }

    fn spawn_worker(self: &Arc<Self>) -> watch::Sender<PendingLists> {
        let (tx, mut rx) = watch::channel::<PendingLists>(None);
        let storage = Arc::downgrade(self);

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(lists) = rx.borrow_and_update().clone() else {
                    continue;
                };
                let Some(storage) = storage.upgrade() else {
                    break;
                };
                match storage.rebuild(lists).await {
                    Ok(rules) => debug!(rules, "Background rebuild finished"),
                    Err(e) => warn!(error = %e, "Background rebuild failed"),
                }
            }
            debug!("Rebuild worker stopped");
        });

        tx
    }
}

impl std::fmt::Debug for RuleStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStorage")
            .field("rules", &self.current.load().len())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
