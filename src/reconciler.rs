use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};

use crate::errors::{AppError, AppResult};
use crate::model::{Coordinate, CoordinateRecord, DistrictName};
use crate::query::{build_query, QueryQualifier};
use crate::resolver::{ResolutionFailure, Resolver};
use crate::store::CoordinateStore;

/// Cooperative cancellation shared between a batch and whoever may stop it.
#[derive(Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let mut notified = pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileStats {
    pub requested: usize,
    pub cache_hits: usize,
    pub lookups: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Records for the requested districts, in request order.
    pub records: Vec<CoordinateRecord>,
    pub failures: Vec<(DistrictName, ResolutionFailure)>,
    pub stats: ReconcileStats,
    pub persist_error: Option<String>,
    pub cancelled: bool,
}

/// Merges the coordinate snapshot with a run's districts, resolving only
/// what the snapshot is missing.
pub struct CacheReconciler {
    store: CoordinateStore,
    resolver: Resolver,
    qualifier: QueryQualifier,
    guard: AsyncMutex<()>,
}

impl CacheReconciler {
    pub fn new(store: CoordinateStore, resolver: Resolver, qualifier: QueryQualifier) -> Self {
        Self {
            store,
            resolver,
            qualifier,
            guard: AsyncMutex::new(()),
        }
    }

    pub fn store(&self) -> &CoordinateStore {
        &self.store
    }

    pub async fn reconcile(
        &self,
        required: &[DistrictName],
        cancel: Option<&CancelSignal>,
    ) -> AppResult<ReconcileReport> {
        let _lock = self.guard.lock().await;
        let required = dedupe(required);
        let mut stats = ReconcileStats {
            requested: required.len(),
            ..ReconcileStats::default()
        };

        let (mut cached, snapshot_was_corrupt) = self.load_cached().await?;
        let missing: Vec<&DistrictName> = required
            .iter()
            .filter(|name| !cached.contains_key(*name))
            .collect();
        stats.cache_hits = required.len() - missing.len();
        debug!(
            requested = stats.requested,
            cached = stats.cache_hits,
            missing = missing.len(),
            "reconciling district coordinates"
        );

        let issued_before = self.resolver.requests_issued();
        let mut failures = Vec::new();
        let mut cancelled = false;
        for name in missing {
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                cancelled = true;
                break;
            }
            let query = build_query(name, &self.qualifier);
            let outcome = match cancel {
                Some(signal) => tokio::select! {
                    biased;
                    _ = signal.cancelled() => None,
                    outcome = self.resolver.resolve(&query) => Some(outcome),
                },
                None => Some(self.resolver.resolve(&query).await),
            };
            let Some(outcome) = outcome else {
                cancelled = true;
                break;
            };

            match outcome {
                Ok(coordinate) => {
                    cached.insert(name.clone(), (coordinate, true));
                    stats.resolved += 1;
                }
                Err(failure) => {
                    warn!(district = %name, kind = failure.kind(), %failure, "district left unresolved");
                    failures.push((name.clone(), failure));
                    stats.unresolved += 1;
                }
            }
        }
        // Counts a request abandoned mid-flight too; the service saw it.
        stats.lookups = usize::try_from(self.resolver.requests_issued() - issued_before)
            .unwrap_or(usize::MAX);
        if cancelled {
            warn!(
                resolved = stats.resolved,
                attempted = stats.lookups,
                "district resolution cancelled; keeping partial results"
            );
        }

        let persist_error = if stats.resolved > 0 || snapshot_was_corrupt {
            self.persist(&cached).await
        } else {
            None
        };

        let records = required
            .iter()
            .filter_map(|name| {
                cached.get(name).map(|(coordinate, fresh)| {
                    if *fresh {
                        CoordinateRecord::resolved(name.clone(), *coordinate)
                    } else {
                        CoordinateRecord::cached(name.clone(), *coordinate)
                    }
                })
            })
            .collect();

        info!(
            requested = stats.requested,
            cache_hits = stats.cache_hits,
            lookups = stats.lookups,
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            "district coordinates reconciled"
        );

        Ok(ReconcileReport {
            records,
            failures,
            stats,
            persist_error,
            cancelled,
        })
    }

    async fn load_cached(&self) -> AppResult<(HashMap<DistrictName, (Coordinate, bool)>, bool)> {
        let store = self.store.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let result = store.load();
            if let Err(err) = &result {
                if err.is_corrupt_store() {
                    if let Err(quarantine_err) = store.quarantine() {
                        warn!(?quarantine_err, "failed to move corrupt snapshot aside");
                    }
                }
            }
            result
        })
        .await?;

        match loaded {
            Ok(records) => Ok((
                records
                    .into_iter()
                    .map(|record| (record.name, (record.coordinate, false)))
                    .collect(),
                false,
            )),
            Err(err) if err.is_corrupt_store() => {
                warn!(%err, "ignoring corrupt coordinate snapshot; every district will be looked up");
                Ok((HashMap::new(), true))
            }
            Err(err) => {
                warn!(%err, "coordinate snapshot unreadable; resolving without it and leaving it in place");
                Ok((HashMap::new(), false))
            }
        }
    }

    async fn persist(&self, cached: &HashMap<DistrictName, (Coordinate, bool)>) -> Option<String> {
        let snapshot: Vec<CoordinateRecord> = cached
            .iter()
            .map(|(name, (coordinate, _))| CoordinateRecord::cached(name.clone(), *coordinate))
            .collect();
        let store = self.store.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
        let err = match saved {
            Ok(Ok(())) => return None,
            Ok(Err(err)) => err.to_string(),
            Err(join_err) => AppError::from(join_err).to_string(),
        };
        error!(
            path = %self.store.path().display(),
            error = %err,
            "coordinate snapshot not saved; resolved districts will be looked up again next run"
        );
        Some(err)
    }
}

fn dedupe(required: &[DistrictName]) -> Vec<DistrictName> {
    let mut seen = HashSet::with_capacity(required.len());
    let mut unique = Vec::with_capacity(required.len());
    for name in required {
        if seen.insert(name) {
            unique.push(name.clone());
        } else {
            debug!(district = %name, "ignoring duplicate district in batch");
        }
    }
    unique
}
