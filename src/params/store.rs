//! The parameter store: single source of truth for all runtime parameters.
//!
//! Every component holds an `Arc<ParameterStore>` and either reads on demand
//! or subscribes to a group. No component keeps a private copy of parameter
//! state, and no component falls back to a hardcoded default: reading an
//! unset required key is a hard [`IsiError::ConfigMissing`].
//!
//! # Subscriptions
//!
//! Subscribers are keyed by `(group, subscriber key)`; registering the same
//! pair again replaces the callback, so repeated wiring is idempotent.
//! Callbacks run synchronously on the updating thread, in registration
//! order, after the store lock has been released; a callback may therefore
//! read the store (or even update another group) without deadlocking.
//! Callbacks must not perform long work; hand anything slow to the owning
//! component's own thread.
//!
//! # Persistence
//!
//! Non-volatile groups persist to a single JSON file via write-temp, fsync,
//! rename, keeping one `.bak` of the previous contents. Volatile groups
//! (`camera`, `monitor`) are written as their descriptor sentinel defaults
//! so their absence across restarts is explicit. Persistence failures are
//! logged as warnings; the in-memory update always stands.

use crate::error::{IsiError, IsiResult};
use crate::params::descriptor::GroupDescriptor;
use crate::params::value::ParamValue;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

/// Partial mapping handed to update calls and subscriber callbacks.
pub type ParamMap = BTreeMap<String, ParamValue>;

type SubscriberFn = Arc<dyn Fn(&ParamMap) + Send + Sync>;

/// Grouped parameter store with change subscriptions and atomic persistence.
pub struct ParameterStore {
    groups: RwLock<BTreeMap<String, ParamMap>>,
    descriptors: BTreeMap<String, GroupDescriptor>,
    subscribers: Mutex<BTreeMap<String, Vec<(String, SubscriberFn)>>>,
    config_path: PathBuf,
}

impl ParameterStore {
    /// Build a store from descriptors, merging any persisted file over the
    /// descriptor defaults. Volatile groups always start at their sentinel
    /// defaults regardless of file contents.
    pub fn new(config_path: impl Into<PathBuf>, descriptors: Vec<GroupDescriptor>) -> IsiResult<Self> {
        let config_path = config_path.into();

        let mut groups: BTreeMap<String, ParamMap> = BTreeMap::new();
        for desc in &descriptors {
            groups.insert(desc.name.to_string(), desc.defaults());
        }

        if config_path.exists() {
            let text = fs::read_to_string(&config_path)?;
            let on_disk: BTreeMap<String, ParamMap> = serde_json::from_str(&text)?;
            for (name, values) in on_disk {
                let volatile = descriptors
                    .iter()
                    .find(|d| d.name == name)
                    .map(|d| d.volatile);
                match volatile {
                    Some(false) => {
                        if let Some(group) = groups.get_mut(&name) {
                            for (k, v) in values {
                                group.insert(k, v);
                            }
                        }
                    }
                    Some(true) => {
                        // Stale hardware state from a previous run; sentinels stand
                        // until re-detection.
                        debug!(group = %name, "ignoring persisted volatile group");
                    }
                    None => warn!(group = %name, "ignoring unknown group in parameter file"),
                }
            }
        }

        let descriptors = descriptors
            .into_iter()
            .map(|d| (d.name.to_string(), d))
            .collect();

        Ok(Self {
            groups: RwLock::new(groups),
            descriptors,
            subscribers: Mutex::new(BTreeMap::new()),
            config_path,
        })
    }

    /// Descriptor for a group.
    pub fn descriptor(&self, group: &str) -> IsiResult<&GroupDescriptor> {
        self.descriptors
            .get(group)
            .ok_or_else(|| IsiError::UnknownGroup(group.to_string()))
    }

    /// Read one value. `Null` counts as unset and is an error.
    pub fn get(&self, group: &str, key: &str) -> IsiResult<ParamValue> {
        let groups = self.read_guard();
        let mapping = groups
            .get(group)
            .ok_or_else(|| IsiError::UnknownGroup(group.to_string()))?;
        match mapping.get(key) {
            Some(v) if !v.is_null() => Ok(v.clone()),
            _ => Err(IsiError::ConfigMissing {
                group: group.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Read one value as f64.
    pub fn get_f64(&self, group: &str, key: &str) -> IsiResult<f64> {
        let v = self.get(group, key)?;
        v.as_f64().ok_or_else(|| {
            IsiError::ValidationFailed(format!("{group}.{key} is not numeric: {v}"))
        })
    }

    /// Read one value as i64.
    pub fn get_i64(&self, group: &str, key: &str) -> IsiResult<i64> {
        let v = self.get(group, key)?;
        v.as_i64().ok_or_else(|| {
            IsiError::ValidationFailed(format!("{group}.{key} is not an integer: {v}"))
        })
    }

    /// Read one value as bool.
    pub fn get_bool(&self, group: &str, key: &str) -> IsiResult<bool> {
        let v = self.get(group, key)?;
        v.as_bool().ok_or_else(|| {
            IsiError::ValidationFailed(format!("{group}.{key} is not a bool: {v}"))
        })
    }

    /// Read one value as an owned string.
    pub fn get_string(&self, group: &str, key: &str) -> IsiResult<String> {
        let v = self.get(group, key)?;
        v.as_str().map(str::to_string).ok_or_else(|| {
            IsiError::ValidationFailed(format!("{group}.{key} is not a string: {v}"))
        })
    }

    /// Snapshot one whole group.
    pub fn get_group(&self, group: &str) -> IsiResult<ParamMap> {
        let groups = self.read_guard();
        groups
            .get(group)
            .cloned()
            .ok_or_else(|| IsiError::UnknownGroup(group.to_string()))
    }

    /// Snapshot every group (for `get_parameters` and session metadata).
    pub fn snapshot_all(&self) -> BTreeMap<String, ParamMap> {
        self.read_guard().clone()
    }

    /// Apply a partial update from trusted backend code.
    ///
    /// Validates against the descriptor, merges, persists (for non-volatile
    /// groups), then invokes this group's subscribers with the partial map.
    pub fn update(&self, group: &str, partial: ParamMap) -> IsiResult<()> {
        let desc = self.descriptor(group)?;
        desc.validate_partial(&partial)?;
        let volatile = desc.volatile;

        {
            let mut groups = self.write_guard();
            let mapping = groups
                .get_mut(group)
                .ok_or_else(|| IsiError::UnknownGroup(group.to_string()))?;
            for (k, v) in &partial {
                mapping.insert(k.clone(), v.clone());
            }
        }

        if !volatile {
            if let Err(err) = self.save() {
                warn!(group, error = %err, "parameter persistence failed; in-memory update kept");
            }
        }

        self.notify(group, &partial);
        Ok(())
    }

    /// Apply a partial update originating from the frontend.
    ///
    /// Identical to [`update`](Self::update) but rejects hardware-capability
    /// fields with [`IsiError::FieldNotUserEditable`] before validation.
    pub fn update_from_frontend(&self, group: &str, partial: ParamMap) -> IsiResult<()> {
        self.descriptor(group)?.check_user_editable(&partial)?;
        self.update(group, partial)
    }

    /// Register a subscriber for one group.
    ///
    /// `key` is the subscriber's stable identity; re-registering the same
    /// `(group, key)` replaces the previous callback.
    pub fn subscribe(
        &self,
        group: &str,
        key: &str,
        callback: impl Fn(&ParamMap) + Send + Sync + 'static,
    ) {
        let mut subs = self.subs_guard();
        let entries = subs.entry(group.to_string()).or_default();
        let callback: SubscriberFn = Arc::new(callback);
        if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = callback;
        } else {
            entries.push((key.to_string(), callback));
        }
    }

    /// Remove a subscriber registration. Unknown keys are a no-op.
    pub fn unsubscribe(&self, group: &str, key: &str) {
        let mut subs = self.subs_guard();
        if let Some(entries) = subs.get_mut(group) {
            entries.retain(|(k, _)| k != key);
        }
    }

    /// Persist all groups atomically, writing volatile groups as sentinels.
    pub fn save(&self) -> IsiResult<()> {
        let mut on_disk = self.read_guard().clone();
        for (name, desc) in &self.descriptors {
            if desc.volatile {
                on_disk.insert(name.clone(), desc.defaults());
            }
        }

        let json = serde_json::to_string_pretty(&on_disk)?;
        atomic_write(&self.config_path, json.as_bytes())
    }

    fn notify(&self, group: &str, partial: &ParamMap) {
        // Clone the callback list so the subscriber lock is not held during
        // delivery; a callback may subscribe/unsubscribe or touch the store.
        let callbacks: Vec<SubscriberFn> = {
            let subs = self.subs_guard();
            subs.get(group)
                .map(|entries| entries.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(partial);
        }
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ParamMap>> {
        match self.groups.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ParamMap>> {
        match self.groups.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn subs_guard(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<(String, SubscriberFn)>>> {
        match self.subscribers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Write `bytes` to `path` via temp file + fsync + rename, keeping one
/// `.bak` of the previous file.
fn atomic_write(path: &Path, bytes: &[u8]) -> IsiResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if path.exists() {
        let bak = path.with_extension("json.bak");
        // Best effort; a failed backup must not block the real write.
        if let Err(err) = fs::copy(path, &bak) {
            warn!(path = %path.display(), error = %err, "could not keep parameter backup");
        }
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::descriptor::standard_descriptors;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> ParameterStore {
        ParameterStore::new(dir.join("isi_parameters.json"), standard_descriptors()).unwrap()
    }

    #[test]
    fn get_unset_required_key_fails() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        // selected_camera defaults to "" (set); a Null-valued probe key needs
        // constructing via update, so exercise the unknown-key path instead.
        assert!(matches!(
            store.get("monitor", "no_such_key"),
            Err(IsiError::ConfigMissing { .. })
        ));
        assert!(matches!(
            store.get("nope", "x"),
            Err(IsiError::UnknownGroup(_))
        ));
    }

    #[test]
    fn update_validates_before_mutation() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let mut partial = ParamMap::new();
        partial.insert("distance_cm".into(), ParamValue::Float(7.0));
        partial.insert("tilt_angle_deg".into(), ParamValue::Float(500.0));
        assert!(store.update("monitor", partial).is_err());

        // First key must not have been merged.
        assert_eq!(store.get_f64("monitor", "distance_cm").unwrap(), 10.0);
    }

    #[test]
    fn frontend_cannot_touch_capability_fields() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let mut partial = ParamMap::new();
        partial.insert("fps".into(), ParamValue::Float(120.0));
        assert!(matches!(
            store.update_from_frontend("camera", partial),
            Err(IsiError::FieldNotUserEditable { .. })
        ));

        let mut ok = ParamMap::new();
        ok.insert("selected_camera".into(), ParamValue::Str("Mock-0".into()));
        store.update_from_frontend("camera", ok).unwrap();
        assert_eq!(
            store.get_string("camera", "selected_camera").unwrap(),
            "Mock-0"
        );
    }

    #[test]
    fn subscribers_fire_in_registration_order_and_idempotently() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = calls.clone();
        store.subscribe("stimulus", "first", move |_| c1.lock().unwrap().push(1));
        let c2 = calls.clone();
        store.subscribe("stimulus", "second", move |_| c2.lock().unwrap().push(2));
        // Re-register "first": replaces, does not duplicate.
        let c3 = calls.clone();
        store.subscribe("stimulus", "first", move |_| c3.lock().unwrap().push(1));

        let mut partial = ParamMap::new();
        partial.insert("bar_width_deg".into(), ParamValue::Float(25.0));
        store.update("stimulus", partial).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn subscriber_may_read_store_reentrantly() {
        let dir = tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let store2 = store.clone();
        store.subscribe("stimulus", "reader", move |_| {
            *seen2.lock().unwrap() = Some(store2.get_f64("stimulus", "bar_width_deg").unwrap());
        });

        let mut partial = ParamMap::new();
        partial.insert("bar_width_deg".into(), ParamValue::Float(30.0));
        store.update("stimulus", partial).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(30.0));
    }

    #[test]
    fn volatile_groups_persist_as_sentinels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("isi_parameters.json");
        let store = ParameterStore::new(&path, standard_descriptors()).unwrap();

        // Populate volatile detection outputs in memory.
        let mut cam = ParamMap::new();
        cam.insert("fps".into(), ParamValue::Float(30.0));
        cam.insert(
            "available_cameras".into(),
            ParamValue::StrArray(vec!["Mock-0".into()]),
        );
        store.update("camera", cam).unwrap();
        store.save().unwrap();

        // Live values stay.
        assert_eq!(store.get_f64("camera", "fps").unwrap(), 30.0);

        // On-disk values are sentinels.
        let text = fs::read_to_string(&path).unwrap();
        let on_disk: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(on_disk["camera"]["fps"], serde_json::json!(-1.0));
        assert_eq!(
            on_disk["camera"]["available_cameras"],
            serde_json::json!([])
        );

        // A fresh store sees sentinels, not the stale detection state.
        let reloaded = ParameterStore::new(&path, standard_descriptors()).unwrap();
        assert_eq!(reloaded.get_f64("camera", "fps").unwrap(), -1.0);
    }

    #[test]
    fn non_volatile_groups_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("isi_parameters.json");

        {
            let store = ParameterStore::new(&path, standard_descriptors()).unwrap();
            let mut partial = ParamMap::new();
            partial.insert("bar_width_deg".into(), ParamValue::Float(24.0));
            store.update("stimulus", partial).unwrap();
        }

        let store = ParameterStore::new(&path, standard_descriptors()).unwrap();
        assert_eq!(store.get_f64("stimulus", "bar_width_deg").unwrap(), 24.0);
        // A backup of the previous file exists after the second write.
        let mut partial = ParamMap::new();
        partial.insert("bar_width_deg".into(), ParamValue::Float(26.0));
        store.update("stimulus", partial).unwrap();
        assert!(path.with_extension("json.bak").exists());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        store.subscribe("system", "counter", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut partial = ParamMap::new();
        partial.insert("development_mode".into(), ParamValue::Bool(true));
        store.update("system", partial.clone()).unwrap();
        store.unsubscribe("system", "counter");
        store.update("system", partial).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
