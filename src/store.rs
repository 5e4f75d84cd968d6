//! Resource Store: per-backend row tables, loading and error flags, and the
//! aggregated [`Snapshot`] served to the renderer.
//!
//! Snapshots are cached. Readers take the shared lock and return the cached
//! snapshot when nothing changed since it was built; otherwise the first
//! reader escalates to the exclusive lock and recomputes only the aggregates
//! whose kind is dirty.

use crate::model::{BackendName, ResourceKind, ResourceRow};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Point-in-time view of the store. Never partially updated.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Snapshot {
    /// Selected backends in selection order.
    pub backends: Vec<BackendName>,
    pub loading: BTreeMap<BackendName, BTreeSet<ResourceKind>>,
    pub errors: BTreeMap<BackendName, BTreeMap<ResourceKind, String>>,
    /// Rows of every selected backend, concatenated in selection order.
    pub rows: BTreeMap<ResourceKind, Arc<[ResourceRow]>>,
    pub revision: u64,
}

impl Snapshot {
    pub fn rows(&self, kind: ResourceKind) -> &[ResourceRow] {
        self.rows.get(&kind).map(|rows| rows.as_ref()).unwrap_or(&[])
    }

    /// First error recorded for `backend`, in tracked-kind order.
    pub fn error(&self, backend: &BackendName) -> Option<&str> {
        let errors = self.errors.get(backend)?;
        ResourceKind::ALL
            .iter()
            .find_map(|kind| errors.get(kind))
            .map(String::as_str)
    }

    pub fn error_for(&self, backend: &BackendName, kind: ResourceKind) -> Option<&str> {
        self.errors
            .get(backend)
            .and_then(|errors| errors.get(&kind))
            .map(String::as_str)
    }

    pub fn is_loading(&self, backend: &BackendName, kind: ResourceKind) -> bool {
        self.loading
            .get(backend)
            .is_some_and(|kinds| kinds.contains(&kind))
    }

    pub fn any_loading(&self) -> bool {
        self.loading.values().any(|kinds| !kinds.is_empty())
    }
}

#[derive(Default)]
struct StoreState {
    selected: Vec<BackendName>,
    tables: HashMap<ResourceKind, HashMap<BackendName, Vec<ResourceRow>>>,
    loading: HashSet<(BackendName, ResourceKind)>,
    errors: HashMap<(BackendName, ResourceKind), String>,
    dirty: BTreeSet<ResourceKind>,
    aggregates: BTreeMap<ResourceKind, Arc<[ResourceRow]>>,
    cached: Option<Arc<Snapshot>>,
    revision: u64,
}

impl StoreState {
    fn is_selected(&self, name: &BackendName) -> bool {
        self.selected.contains(name)
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.cached = None;
    }

    fn mark_dirty(&mut self, kind: ResourceKind) {
        self.dirty.insert(kind);
        self.touch();
    }

    fn mark_all_dirty(&mut self) {
        self.dirty.extend(ResourceKind::ALL);
        self.touch();
    }

    fn flatten(&self, kind: ResourceKind) -> Arc<[ResourceRow]> {
        let Some(table) = self.tables.get(&kind) else {
            return Arc::from(Vec::<ResourceRow>::new());
        };
        self.selected
            .iter()
            .filter_map(|name| table.get(name))
            .flat_map(|rows| rows.iter().cloned())
            .collect::<Vec<_>>()
            .into()
    }

    fn rebuild(&mut self) -> Arc<Snapshot> {
        let dirty = std::mem::take(&mut self.dirty);
        for kind in dirty {
            let rows = self.flatten(kind);
            self.aggregates.insert(kind, rows);
        }

        let mut loading: BTreeMap<BackendName, BTreeSet<ResourceKind>> = BTreeMap::new();
        for (name, kind) in &self.loading {
            loading.entry(name.clone()).or_default().insert(*kind);
        }
        let mut errors: BTreeMap<BackendName, BTreeMap<ResourceKind, String>> = BTreeMap::new();
        for ((name, kind), message) in &self.errors {
            errors
                .entry(name.clone())
                .or_default()
                .insert(*kind, message.clone());
        }

        let snapshot = Arc::new(Snapshot {
            backends: self.selected.clone(),
            loading,
            errors,
            rows: self.aggregates.clone(),
            revision: self.revision,
        });
        self.cached = Some(snapshot.clone());
        snapshot
    }
}

#[derive(Default)]
pub struct ResourceStore {
    state: RwLock<StoreState>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<T>(&self, apply: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut state)
    }

    fn read<T>(&self, apply: impl FnOnce(&StoreState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        apply(&state)
    }

    /// Returns false when `name` was already selected.
    pub fn add_backend(&self, name: &BackendName) -> bool {
        self.write(|state| {
            if state.is_selected(name) {
                return false;
            }
            state.selected.push(name.clone());
            for kind in ResourceKind::ALL {
                state
                    .tables
                    .entry(kind)
                    .or_default()
                    .insert(name.clone(), Vec::new());
            }
            state.mark_all_dirty();
            true
        })
    }

    /// Drops every row, flag and error of `name`. Returns false when it was
    /// not selected.
    pub fn remove_backend(&self, name: &BackendName) -> bool {
        self.write(|state| {
            let Some(index) = state.selected.iter().position(|selected| selected == name) else {
                return false;
            };
            state.selected.remove(index);
            for table in state.tables.values_mut() {
                table.remove(name);
            }
            state.loading.retain(|(backend, _)| backend != name);
            state.errors.retain(|(backend, _), _| backend != name);
            state.mark_all_dirty();
            true
        })
    }

    /// Replaces the rows of (name, kind), clears its loading flag and its
    /// error. Results for unselected backends are dropped.
    pub fn set_rows(&self, name: &BackendName, kind: ResourceKind, rows: Vec<ResourceRow>) -> bool {
        self.write(|state| {
            if !state.is_selected(name) {
                debug!("dropping {kind} rows for unselected backend {name}");
                return false;
            }
            state
                .tables
                .entry(kind)
                .or_default()
                .insert(name.clone(), rows);
            let key = (name.clone(), kind);
            state.loading.remove(&key);
            state.errors.remove(&key);
            state.mark_dirty(kind);
            true
        })
    }

    pub fn set_loading(&self, name: &BackendName, kind: ResourceKind, loading: bool) -> bool {
        self.write(|state| {
            if !state.is_selected(name) {
                return false;
            }
            let key = (name.clone(), kind);
            let changed = if loading {
                state.loading.insert(key)
            } else {
                state.loading.remove(&key)
            };
            if changed {
                state.touch();
            }
            true
        })
    }

    /// Records an error for (name, kind) and clears its loading flag. Rows
    /// already held for the pair are kept as stale data.
    pub fn set_error(&self, name: &BackendName, kind: ResourceKind, message: impl Into<String>) -> bool {
        let message = message.into();
        self.write(|state| {
            if !state.is_selected(name) {
                debug!("dropping {kind} error for unselected backend {name}: {message}");
                return false;
            }
            let key = (name.clone(), kind);
            state.loading.remove(&key);
            state.errors.insert(key, message);
            state.touch();
            true
        })
    }

    pub fn clear_errors(&self) -> usize {
        self.write(|state| {
            let cleared = state.errors.len();
            if cleared > 0 {
                state.errors.clear();
                state.touch();
            }
            cleared
        })
    }

    pub fn selected(&self) -> Vec<BackendName> {
        self.read(|state| state.selected.clone())
    }

    pub fn is_selected(&self, name: &BackendName) -> bool {
        self.read(|state| state.is_selected(name))
    }

    pub fn is_loading(&self, name: &BackendName, kind: ResourceKind) -> bool {
        self.read(|state| state.loading.contains(&(name.clone(), kind)))
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        if let Some(cached) = self.read(|state| state.cached.clone()) {
            return cached;
        }

        // Another reader may have rebuilt while this one waited for the lock.
        self.write(|state| state.cached.clone().unwrap_or_else(|| state.rebuild()))
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceStore;
    use crate::backend::fake::pod_row;
    use crate::model::{BackendName, ResourceKind, ResourceRow};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn rows(backend: &str, names: &[&str]) -> Vec<ResourceRow> {
        let backend = BackendName::new(backend);
        names.iter().map(|name| pod_row(&backend, name)).collect()
    }

    fn names(rows: &[ResourceRow]) -> Vec<String> {
        rows.iter()
            .map(|row| format!("{}/{}", row.backend, row.name))
            .collect()
    }

    #[test]
    fn aggregate_follows_selection_order_not_arrival_order() {
        let store = ResourceStore::new();
        let alpha = BackendName::new("alpha");
        let beta = BackendName::new("beta");
        store.add_backend(&alpha);
        store.add_backend(&beta);

        store.set_rows(&beta, ResourceKind::Pods, rows("beta", &["b-1"]));
        store.set_rows(&alpha, ResourceKind::Pods, rows("alpha", &["a-1", "a-2"]));

        let snapshot = store.snapshot();
        assert_eq!(
            names(snapshot.rows(ResourceKind::Pods)),
            vec!["alpha/a-1", "alpha/a-2", "beta/b-1"]
        );
        assert!(snapshot.rows(ResourceKind::Deployments).is_empty());
    }

    #[test]
    fn alpha_then_beta_yields_three_rows_alpha_first() {
        let store = ResourceStore::new();
        let alpha = BackendName::new("alpha");
        let beta = BackendName::new("beta");
        store.add_backend(&alpha);
        store.add_backend(&beta);
        store.set_loading(&alpha, ResourceKind::Pods, true);
        store.set_loading(&beta, ResourceKind::Pods, true);

        store.set_rows(&alpha, ResourceKind::Pods, rows("alpha", &["a-1", "a-2"]));
        assert!(store.snapshot().is_loading(&beta, ResourceKind::Pods));
        store.set_rows(&beta, ResourceKind::Pods, rows("beta", &["b-1"]));

        let snapshot = store.snapshot();
        let pods = snapshot.rows(ResourceKind::Pods);
        assert_eq!(pods.len(), 3);
        assert_eq!(pods[0].backend, alpha);
        assert_eq!(pods[1].backend, alpha);
        assert_eq!(pods[2].backend, beta);
        assert!(!snapshot.any_loading());
    }

    #[test]
    fn error_is_isolated_and_cleared_by_next_success() {
        let store = ResourceStore::new();
        let alpha = BackendName::new("alpha");
        let beta = BackendName::new("beta");
        store.add_backend(&alpha);
        store.add_backend(&beta);
        store.set_rows(&beta, ResourceKind::Pods, rows("beta", &["b-1"]));

        store.set_loading(&alpha, ResourceKind::Pods, true);
        store.set_error(&alpha, ResourceKind::Pods, "permission denied");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.error(&alpha), Some("permission denied"));
        assert_eq!(snapshot.error(&beta), None);
        assert!(!snapshot.is_loading(&alpha, ResourceKind::Pods));
        assert_eq!(names(snapshot.rows(ResourceKind::Pods)), vec!["beta/b-1"]);

        store.set_rows(&alpha, ResourceKind::Pods, rows("alpha", &["a-1"]));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.error(&alpha), None);
        assert_eq!(
            names(snapshot.rows(ResourceKind::Pods)),
            vec!["alpha/a-1", "beta/b-1"]
        );
    }

    #[test]
    fn errors_are_scoped_to_backend_and_kind() {
        let store = ResourceStore::new();
        let alpha = BackendName::new("alpha");
        store.add_backend(&alpha);
        store.set_error(&alpha, ResourceKind::Pods, "forbidden pods");
        store.set_error(&alpha, ResourceKind::Deployments, "forbidden deployments");

        store.set_rows(&alpha, ResourceKind::Deployments, Vec::new());
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.error_for(&alpha, ResourceKind::Pods),
            Some("forbidden pods")
        );
        assert_eq!(snapshot.error_for(&alpha, ResourceKind::Deployments), None);

        assert_eq!(store.clear_errors(), 1);
        assert!(store.snapshot().errors.is_empty());
    }

    #[test]
    fn add_backend_is_idempotent() {
        let store = ResourceStore::new();
        let alpha = BackendName::new("alpha");
        assert!(store.add_backend(&alpha));
        let once = store.snapshot();
        assert!(!store.add_backend(&alpha));
        let twice = store.snapshot();
        assert_eq!(*once, *twice);
        assert_eq!(store.selected(), vec![alpha]);
    }

    #[test]
    fn remove_backend_drops_everything_it_owned() {
        let store = ResourceStore::new();
        let alpha = BackendName::new("alpha");
        let beta = BackendName::new("beta");
        store.add_backend(&alpha);
        store.add_backend(&beta);
        store.set_rows(&alpha, ResourceKind::Pods, rows("alpha", &["a-1"]));
        store.set_loading(&alpha, ResourceKind::Deployments, true);
        store.set_error(&alpha, ResourceKind::Pods, "stale");
        store.set_rows(&beta, ResourceKind::Pods, rows("beta", &["b-1"]));

        assert!(store.remove_backend(&alpha));
        assert!(!store.remove_backend(&alpha));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.backends, vec![beta]);
        assert_eq!(names(snapshot.rows(ResourceKind::Pods)), vec!["beta/b-1"]);
        assert!(snapshot.errors.is_empty());
        assert!(!snapshot.any_loading());
    }

    #[test]
    fn results_for_unselected_backends_are_ignored() {
        let store = ResourceStore::new();
        let ghost = BackendName::new("ghost");
        assert!(!store.set_rows(&ghost, ResourceKind::Pods, rows("ghost", &["g-1"])));
        assert!(!store.set_error(&ghost, ResourceKind::Pods, "boom"));
        assert!(!store.set_loading(&ghost, ResourceKind::Pods, true));
        let snapshot = store.snapshot();
        assert!(snapshot.backends.is_empty());
        assert!(snapshot.rows(ResourceKind::Pods).is_empty());
        assert!(snapshot.errors.is_empty());
    }

    #[test]
    fn unchanged_store_serves_the_cached_snapshot() {
        let store = ResourceStore::new();
        let alpha = BackendName::new("alpha");
        store.add_backend(&alpha);
        store.set_rows(&alpha, ResourceKind::Pods, rows("alpha", &["a-1"]));

        let first = store.snapshot();
        let second = store.snapshot();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);

        store.set_rows(&alpha, ResourceKind::Pods, rows("alpha", &["a-2"]));
        let third = store.snapshot();
        assert!(third.revision > first.revision);
        assert_eq!(names(third.rows(ResourceKind::Pods)), vec!["alpha/a-2"]);
        // Clean kinds keep sharing their aggregate.
        assert!(Arc::ptr_eq(
            &first.rows[&ResourceKind::Deployments],
            &third.rows[&ResourceKind::Deployments]
        ));
    }

    #[test]
    fn aggregate_matches_independent_model_for_mixed_operations() {
        let store = ResourceStore::new();
        let pool = ["a", "b", "c", "d"];
        let mut selected: Vec<&str> = Vec::new();
        let mut latest: HashMap<&str, Vec<ResourceRow>> = HashMap::new();
        let mut seed: u64 = 0x2545_f491;

        for step in 0..400 {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let backend = pool[((seed >> 33) % pool.len() as u64) as usize];
            let name = BackendName::new(backend);
            match (seed >> 40) % 3 {
                0 => {
                    store.add_backend(&name);
                    if !selected.contains(&backend) {
                        selected.push(backend);
                        latest.insert(backend, Vec::new());
                    }
                }
                1 => {
                    store.remove_backend(&name);
                    selected.retain(|selected| *selected != backend);
                    latest.remove(backend);
                }
                _ => {
                    let count = ((seed >> 50) % 4) as usize;
                    let labels = (0..count)
                        .map(|index| format!("{backend}-{step}-{index}"))
                        .collect::<Vec<_>>();
                    let labels = labels.iter().map(String::as_str).collect::<Vec<_>>();
                    let fresh = rows(backend, &labels);
                    store.set_rows(&name, ResourceKind::Pods, fresh.clone());
                    if selected.contains(&backend) {
                        latest.insert(backend, fresh);
                    }
                }
            }

            let expected = selected
                .iter()
                .flat_map(|backend| latest[backend].iter().cloned())
                .collect::<Vec<_>>();
            assert_eq!(store.snapshot().rows(ResourceKind::Pods), expected.as_slice());
        }
    }

    #[test]
    fn concurrent_readers_never_observe_torn_aggregates() {
        let store = Arc::new(ResourceStore::new());
        let alpha = BackendName::new("alpha");
        let beta = BackendName::new("beta");
        store.add_backend(&alpha);
        store.add_backend(&beta);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let store = store.clone();
                scope.spawn(move || {
                    let mut last_revision = 0;
                    for _ in 0..2_000 {
                        let snapshot = store.snapshot();
                        assert!(snapshot.revision >= last_revision);
                        last_revision = snapshot.revision;

                        let pods = snapshot.rows(ResourceKind::Pods);
                        for backend in ["alpha", "beta"] {
                            let batches = pods
                                .iter()
                                .filter(|row| row.backend.as_str() == backend)
                                .map(|row| row.name.split('#').next().unwrap_or_default())
                                .collect::<std::collections::BTreeSet<_>>();
                            assert!(batches.len() <= 1, "mixed batches: {batches:?}");
                        }
                    }
                });
            }

            for round in 0..500 {
                let a = format!("a{round}");
                let b = format!("b{round}");
                let alpha_rows = [format!("{a}#0"), format!("{a}#1"), format!("{a}#2")];
                let beta_rows = [format!("{b}#0"), format!("{b}#1")];
                let alpha_rows = alpha_rows.iter().map(String::as_str).collect::<Vec<_>>();
                let beta_rows = beta_rows.iter().map(String::as_str).collect::<Vec<_>>();
                store.set_rows(&alpha, ResourceKind::Pods, rows("alpha", &alpha_rows));
                store.set_rows(&beta, ResourceKind::Pods, rows("beta", &beta_rows));
            }
        });

        let snapshot = store.snapshot();
        assert_eq!(
            names(snapshot.rows(ResourceKind::Pods)),
            vec![
                "alpha/a499#0",
                "alpha/a499#1",
                "alpha/a499#2",
                "beta/b499#0",
                "beta/b499#1"
            ]
        );
    }
}
