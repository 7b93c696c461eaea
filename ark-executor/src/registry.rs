//! Instance registry: the process-wide map from VM name to its record.
//!
//! Each entry carries two locks. The transition lock is held for the whole
//! of a lifecycle transition and serializes commands on one name; it is
//! only ever acquired with `try_lock`, so a second command fails fast
//! instead of queueing. The record lock guards the committed data and is
//! held only for short, non-blocking sections, so status reads never wait
//! on a transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ark_core::{LifecycleState, VmName, VmSpec};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{ExecutorError, InstanceLayout, SubsystemHandle};

/// Committed state of one VM instance.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct InstanceRecord {
    pub name: VmName,
    pub state: LifecycleState,
    /// The validated request the instance was created from.
    pub spec: VmSpec,
    /// Resolved once `create` has prepared the instance.
    pub layout: Option<InstanceLayout>,
    /// Owned subsystems in launch order.
    pub handles: Vec<Arc<SubsystemHandle>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl InstanceRecord {
    fn new(spec: VmSpec) -> Self {
        let now = Utc::now();
        Self {
            name: spec.name.clone(),
            state: LifecycleState::Creating,
            spec,
            layout: None,
            handles: Vec::new(),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }
}

/// One registered instance.
#[derive(Debug)]
pub struct InstanceEntry {
    name: VmName,
    slot: u16,
    transition: Arc<Mutex<()>>,
    record: RwLock<InstanceRecord>,
    /// Set once the entry leaves the registry; only written under the
    /// transition lock.
    removed: AtomicBool,
}

impl InstanceEntry {
    #[must_use]
    pub fn name(&self) -> &VmName {
        &self.name
    }

    /// Namespace slot reserved for this instance until it is removed.
    #[must_use]
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Clone of the last committed record.
    #[must_use]
    pub fn snapshot(&self) -> InstanceRecord {
        self.read().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.read().state
    }

    /// Apply `f` to the record and bump `updated_at`.
    pub fn update<R>(&self, f: impl FnOnce(&mut InstanceRecord) -> R) -> R {
        let mut record = self.write();
        let out = f(&mut record);
        record.updated_at = Utc::now();
        out
    }

    /// Take the transition lock without waiting.
    ///
    /// # Errors
    /// Returns [`ExecutorError::TransitionInProgress`] if another command
    /// holds it and [`ExecutorError::NotFound`] if the entry was removed
    /// after the caller looked it up.
    pub fn try_begin(self: &Arc<Self>) -> Result<TransitionGuard, ExecutorError> {
        let guard = Arc::clone(&self.transition)
            .try_lock_owned()
            .map_err(|_| ExecutorError::TransitionInProgress(self.name.clone()))?;
        if self.removed.load(Ordering::Acquire) {
            return Err(ExecutorError::NotFound(self.name.clone()));
        }
        Ok(TransitionGuard { entry: Arc::clone(self), _lock: guard })
    }

    /// Returns `true` while a transition holds the lock.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.transition.try_lock().is_err()
    }

    fn read(&self) -> RwLockReadGuard<'_, InstanceRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InstanceRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to run a transition on one instance.
///
/// Owns its entry so it can move into a spawned task. Released on drop.
#[derive(Debug)]
pub struct TransitionGuard {
    entry: Arc<InstanceEntry>,
    _lock: OwnedMutexGuard<()>,
}

impl TransitionGuard {
    #[must_use]
    pub fn entry(&self) -> &Arc<InstanceEntry> {
        &self.entry
    }
}

/// Map from VM name to instance, in registration order.
#[derive(Debug)]
pub struct InstanceRegistry {
    entries: RwLock<IndexMap<VmName, Arc<InstanceEntry>>>,
    max_slots: u16,
}

impl InstanceRegistry {
    /// Create a registry with `max_slots` namespace slots.
    #[must_use]
    pub fn new(max_slots: u16) -> Self {
        Self { entries: RwLock::new(IndexMap::new()), max_slots }
    }

    /// Register a new instance in CREATING and hand back its transition
    /// guard, already held.
    ///
    /// Reserves the lowest free namespace slot.
    ///
    /// # Errors
    /// Returns [`ExecutorError::AlreadyExists`] if the name is registered
    /// and [`ExecutorError::SlotsExhausted`] if every slot is taken.
    pub fn insert_new(&self, spec: VmSpec) -> Result<TransitionGuard, ExecutorError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&spec.name) {
            return Err(ExecutorError::AlreadyExists(spec.name));
        }

        let slot = (0..self.max_slots)
            .find(|s| entries.values().all(|e| e.slot != *s))
            .ok_or(ExecutorError::SlotsExhausted(self.max_slots))?;

        let entry = Arc::new(InstanceEntry {
            name: spec.name.clone(),
            slot,
            transition: Arc::new(Mutex::new(())),
            record: RwLock::new(InstanceRecord::new(spec)),
            removed: AtomicBool::new(false),
        });
        // Fresh mutex; cannot be contended.
        let guard = entry.try_begin()?;
        entries.insert(entry.name.clone(), Arc::clone(&entry));
        tracing::debug!(vm = %entry.name, slot, "instance registered");
        Ok(guard)
    }

    /// Look up an instance.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotFound`] for unknown names.
    pub fn get(&self, name: &VmName) -> Result<Arc<InstanceEntry>, ExecutorError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(name.clone()))
    }

    /// Apply `f` to a record.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotFound`] for unknown names.
    pub fn update<R>(&self, name: &VmName, f: impl FnOnce(&mut InstanceRecord) -> R) -> Result<R, ExecutorError> {
        Ok(self.get(name)?.update(f))
    }

    /// All entries in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<InstanceEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove an instance and release its slot.
    ///
    /// Callers must hold the entry's transition guard so no transition is
    /// running on it. Handles to the entry obtained earlier can no longer
    /// begin a transition.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotFound`] if the guarded entry is no
    /// longer the one registered under its name.
    pub fn remove(&self, guard: TransitionGuard) -> Result<InstanceRecord, ExecutorError> {
        let name = guard.entry.name.clone();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&name) {
            Some(current) if Arc::ptr_eq(current, &guard.entry) => {}
            _ => return Err(ExecutorError::NotFound(name)),
        }
        let removed = entries.shift_remove(&name).ok_or_else(|| ExecutorError::NotFound(name.clone()))?;
        drop(entries);
        removed.removed.store(true, Ordering::Release);
        tracing::debug!(vm = %name, slot = removed.slot, "instance removed");
        Ok(removed.snapshot())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
