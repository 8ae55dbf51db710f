//! # Parameter Cache Module
//!
//! The local mirror of the device's parameter table.
//!
//! This module handles:
//! - Copy-on-write storage: readers hold immutable snapshots, writers swap
//!   in a new map, so a read never observes a half-applied update
//! - Change notification: every effective change publishes a new snapshot
//! - Name normalization on every write path
//! - Metadata decoration of existing and future entries
//! - Local edit tracking (staged values, dirty listing)

pub mod parameter;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::metadata::MetadataCatalog;
use crate::protocol::{normalize_name, ValueEcho};

pub use parameter::Parameter;

/// Immutable view of the whole cache
pub type Snapshot = Arc<HashMap<String, Parameter>>;

/// Concurrency-safe parameter cache
///
/// Cheap to clone; clones share the same table.
///
/// # Examples
///
/// ```
/// use param_sync::cache::{Parameter, ParameterCache};
/// use param_sync::protocol::ParamType;
///
/// let cache = ParameterCache::new();
/// cache.upsert(Parameter::new("angle_max", 4500.0, ParamType::Int16));
/// assert_eq!(cache.get("ANGLE_MAX").unwrap().value, 4500.0);
/// ```
#[derive(Clone)]
pub struct ParameterCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    snapshot: watch::Sender<Snapshot>,
    metadata: RwLock<Option<Arc<MetadataCatalog>>>,
}

impl std::fmt::Debug for ParameterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for ParameterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterCache {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(HashMap::new()));
        Self {
            inner: Arc::new(CacheInner {
                snapshot,
                metadata: RwLock::new(None),
            }),
        }
    }

    /// Look up a parameter by any spelling of its name
    pub fn get(&self, name: &str) -> Option<Parameter> {
        self.inner
            .snapshot
            .borrow()
            .get(&normalize_name(name))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .snapshot
            .borrow()
            .contains_key(&normalize_name(name))
    }

    /// Current contents
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.snapshot.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.snapshot.borrow().is_empty()
    }

    /// Entries whose name starts with `prefix` (normalized)
    pub fn find_by_prefix(&self, prefix: &str) -> HashMap<String, Parameter> {
        let prefix = normalize_name(prefix);
        self.inner
            .snapshot
            .borrow()
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, param)| (name.clone(), param.clone()))
            .collect()
    }

    /// Receive a new snapshot after every effective change
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Insert or replace an entry
    ///
    /// The name is normalized and metadata is attached when the entry has
    /// none. Returns false when the cache already held an identical entry.
    pub fn upsert(&self, mut param: Parameter) -> bool {
        param.name = normalize_name(&param.name);
        if param.metadata.is_none() {
            param.metadata = self.metadata_for(&param.name);
        }

        self.inner.snapshot.send_if_modified(|snapshot| {
            if snapshot.get(&param.name) == Some(&param) {
                return false;
            }
            Arc::make_mut(snapshot).insert(param.name.clone(), param);
            true
        })
    }

    /// Record a device echo and return the resulting entry
    ///
    /// The echo becomes the confirmed value. A staged local edit is kept
    /// unless the echo confirms it. Applying the same echo twice leaves the
    /// cache unchanged.
    pub fn apply_echo(&self, echo: &ValueEcho) -> Parameter {
        let name = normalize_name(&echo.name);
        let metadata = self.metadata_for(&name);
        let mut result = None;

        self.inner.snapshot.send_if_modified(|snapshot| {
            let next = match snapshot.get(&name) {
                Some(existing) => {
                    let mut next = existing.clone();
                    let staged = existing.is_dirty();
                    next.original_value = echo.value;
                    if !staged {
                        next.value = echo.value;
                    }
                    next.param_type = echo.param_type;
                    if echo.has_valid_index() {
                        next.index = echo.index;
                    }
                    if next.metadata.is_none() {
                        next.metadata = metadata;
                    }
                    if &next == existing {
                        result = Some(next);
                        return false;
                    }
                    next
                }
                None => {
                    let mut next = Parameter::from_echo(echo);
                    next.metadata = metadata;
                    next
                }
            };

            Arc::make_mut(snapshot).insert(name.clone(), next.clone());
            result = Some(next);
            true
        });

        result.unwrap_or_else(|| Parameter::from_echo(echo))
    }

    /// Stage a local edit without talking to the device
    ///
    /// Returns the updated entry, or `None` for an unknown parameter.
    pub fn stage_edit(&self, name: &str, value: f32) -> Option<Parameter> {
        self.modify(name, |param| param.value = param.param_type.coerce(value))
    }

    /// Drop a staged edit, restoring the confirmed value
    pub fn revert(&self, name: &str) -> Option<Parameter> {
        self.modify(name, |param| param.value = param.original_value)
    }

    /// Entries with a staged edit, ordered by table index then name
    pub fn dirty(&self) -> Vec<Parameter> {
        let mut dirty: Vec<Parameter> = self
            .inner
            .snapshot
            .borrow()
            .values()
            .filter(|param| param.is_dirty())
            .cloned()
            .collect();
        dirty.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
        dirty
    }

    /// Install a metadata catalog and decorate every entry it covers
    pub fn install_metadata(&self, catalog: Arc<MetadataCatalog>) {
        *self.inner.metadata.write() = Some(Arc::clone(&catalog));

        self.inner.snapshot.send_if_modified(|snapshot| {
            let covered: Vec<String> = snapshot
                .iter()
                .filter(|(name, param)| {
                    catalog.lookup(name).is_some_and(|m| param.metadata.as_ref() != Some(m))
                })
                .map(|(name, _)| name.clone())
                .collect();
            if covered.is_empty() {
                return false;
            }

            let map = Arc::make_mut(snapshot);
            for name in covered {
                if let Some(param) = map.get_mut(&name) {
                    param.metadata = catalog.lookup(&name).cloned();
                }
            }
            true
        });
    }

    fn metadata_for(&self, name: &str) -> Option<crate::metadata::ParamMetadata> {
        self.inner
            .metadata
            .read()
            .as_ref()
            .and_then(|catalog| catalog.lookup(name).cloned())
    }

    fn modify<F>(&self, name: &str, f: F) -> Option<Parameter>
    where
        F: FnOnce(&mut Parameter),
    {
        let name = normalize_name(name);
        let mut result = None;

        self.inner.snapshot.send_if_modified(|snapshot| {
            let Some(existing) = snapshot.get(&name) else {
                return false;
            };
            let mut next = existing.clone();
            f(&mut next);
            result = Some(next.clone());
            if &next == existing {
                return false;
            }
            Arc::make_mut(snapshot).insert(name.clone(), next);
            true
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ParamMetadata;
    use crate::protocol::{ParamType, INVALID_INDEX};

    fn echo(name: &str, value: f32, index: u16) -> ValueEcho {
        ValueEcho::new(name, value, ParamType::Int16, index, 10)
    }

    #[test]
    fn test_apply_echo_is_idempotent() {
        let cache = ParameterCache::new();
        let msg = echo("ANGLE_MAX", 4500.0, 3);

        cache.apply_echo(&msg);
        let once = cache.snapshot();
        cache.apply_echo(&msg);
        let twice = cache.snapshot();

        assert_eq!(*once, *twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn test_repeated_echo_publishes_once() {
        let cache = ParameterCache::new();
        let mut rx = cache.subscribe();
        let msg = echo("ANGLE_MAX", 4500.0, 3);

        cache.apply_echo(&msg);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        cache.apply_echo(&msg);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_names_are_normalized_on_every_path() {
        let cache = ParameterCache::new();
        cache.upsert(Parameter::new("angle_max ", 4000.0, ParamType::Int16));
        cache.apply_echo(&echo("ANGLE_MAX", 4500.0, 3));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("Angle_Max").unwrap().value, 4500.0);
    }

    #[test]
    fn test_last_write_wins_by_value() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("RC1_MIN", 1000.0, 1));
        cache.apply_echo(&echo("RC1_MIN", 1100.0, 1));
        cache.apply_echo(&echo("RC1_MIN", 1000.0, 1));
        assert_eq!(cache.get("RC1_MIN").unwrap().value, 1000.0);
    }

    #[test]
    fn test_invalid_index_keeps_known_index() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("RC1_MIN", 1000.0, 1));
        cache.apply_echo(&echo("RC1_MIN", 1050.0, INVALID_INDEX));

        let param = cache.get("RC1_MIN").unwrap();
        assert_eq!(param.index, 1);
        assert_eq!(param.value, 1050.0);
    }

    #[test]
    fn test_find_by_prefix() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("SERVO1_FUNCTION", 33.0, 0));
        cache.apply_echo(&echo("SERVO2_FUNCTION", 34.0, 1));
        cache.apply_echo(&echo("RC1_MIN", 1000.0, 2));

        let servos = cache.find_by_prefix("servo");
        assert_eq!(servos.len(), 2);
        assert!(servos.contains_key("SERVO1_FUNCTION"));
        assert!(cache.find_by_prefix("BATT").is_empty());
    }

    #[test]
    fn test_snapshot_is_not_torn_by_later_writes() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("A", 1.0, 0));
        let before = cache.snapshot();

        cache.apply_echo(&echo("B", 2.0, 1));

        assert_eq!(before.len(), 1);
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[test]
    fn test_stage_edit_and_revert() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("RC1_MIN", 1000.0, 1));

        let staged = cache.stage_edit("rc1_min", 1100.0).unwrap();
        assert!(staged.is_dirty());
        assert_eq!(staged.original_value, 1000.0);
        assert_eq!(cache.dirty().len(), 1);

        let reverted = cache.revert("RC1_MIN").unwrap();
        assert!(!reverted.is_dirty());
        assert!(cache.dirty().is_empty());
    }

    #[test]
    fn test_stage_edit_unknown_parameter() {
        let cache = ParameterCache::new();
        assert!(cache.stage_edit("NOPE", 1.0).is_none());
    }

    #[test]
    fn test_echo_keeps_unconfirmed_edit() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("RC1_MIN", 1000.0, 1));
        cache.stage_edit("RC1_MIN", 1100.0);

        // A refresh echo of the old value must not discard the edit
        let param = cache.apply_echo(&echo("RC1_MIN", 1000.0, 1));
        assert_eq!(param.value, 1100.0);
        assert!(param.is_dirty());

        // The device confirming the edit clears the dirty flag
        let param = cache.apply_echo(&echo("RC1_MIN", 1100.0, 1));
        assert!(!param.is_dirty());
    }

    #[test]
    fn test_dirty_is_ordered_by_index() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("B", 1.0, 5));
        cache.apply_echo(&echo("A", 1.0, 2));
        cache.stage_edit("B", 2.0);
        cache.stage_edit("A", 2.0);

        let names: Vec<String> = cache.dirty().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_install_metadata_decorates_entries() {
        let cache = ParameterCache::new();
        cache.apply_echo(&echo("ANGLE_MAX", 4500.0, 0));

        let mut catalog = MetadataCatalog::new();
        catalog.insert(
            "ANGLE_MAX",
            ParamMetadata {
                units: Some("cdeg".to_string()),
                ..Default::default()
            },
        );
        catalog.insert(
            "FRAME_CLASS",
            ParamMetadata {
                reboot_required: true,
                ..Default::default()
            },
        );
        cache.install_metadata(Arc::new(catalog));

        assert_eq!(cache.get("ANGLE_MAX").unwrap().display_value(), "4500 cdeg");

        // Entries arriving later are decorated too
        cache.apply_echo(&echo("FRAME_CLASS", 1.0, 1));
        assert!(cache.get("FRAME_CLASS").unwrap().metadata.unwrap().reboot_required);
    }

    #[tokio::test]
    async fn test_subscribers_see_new_snapshots() {
        let cache = ParameterCache::new();
        let mut rx = cache.subscribe();

        let writer = cache.clone();
        tokio::spawn(async move {
            writer.apply_echo(&echo("ANGLE_MAX", 4500.0, 0));
        });

        rx.changed().await.unwrap();
        assert!(rx.borrow().contains_key("ANGLE_MAX"));
    }
}
