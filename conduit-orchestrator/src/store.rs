//! Pipeline store
//!
//! Keeps every pipeline and its instances in memory, keyed by name and id,
//! and checkpoints them to a JSON file.
//!
//! Each instance sits in its own [`InstanceSlot`]. Writers go through the
//! slot's async mutex, held for the whole read-modify-write including executor
//! calls; readers get the last published snapshot and never wait on writers.

use chrono::{DateTime, Utc};
use conduit_core::domain::instance::PipelineInstance;
use conduit_core::domain::pipeline::{Pipeline, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Why a slot could not be locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("instance is busy")]
    Busy,
    #[error("instance was deleted")]
    Removed,
}

/// Checkpoint failures
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

// =============================================================================
// Instances
// =============================================================================

struct InstanceRecord {
    instance: PipelineInstance,
    removed: bool,
}

/// Owner of one instance's state
pub struct InstanceSlot {
    id: u64,
    record: tokio::sync::Mutex<InstanceRecord>,
    view: RwLock<PipelineInstance>,
}

impl InstanceSlot {
    fn new(instance: PipelineInstance) -> Self {
        Self {
            id: instance.id,
            view: RwLock::new(instance.clone()),
            record: tokio::sync::Mutex::new(InstanceRecord {
                instance,
                removed: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Last published state of the instance
    pub fn snapshot(&self) -> PipelineInstance {
        read(&self.view).clone()
    }

    /// Waits for exclusive access
    pub async fn lock(&self) -> Result<InstanceGuard<'_>, SlotError> {
        let record = self.record.lock().await;
        InstanceGuard::new(self, record)
    }

    /// Exclusive access, or [`SlotError::Busy`] if another writer holds it
    pub fn try_lock(&self) -> Result<InstanceGuard<'_>, SlotError> {
        let record = self.record.try_lock().map_err(|_| SlotError::Busy)?;
        InstanceGuard::new(self, record)
    }
}

/// Exclusive handle on an instance; publishes the new state when dropped
pub struct InstanceGuard<'a> {
    slot: &'a InstanceSlot,
    record: tokio::sync::MutexGuard<'a, InstanceRecord>,
}

impl<'a> InstanceGuard<'a> {
    fn new(
        slot: &'a InstanceSlot,
        record: tokio::sync::MutexGuard<'a, InstanceRecord>,
    ) -> Result<Self, SlotError> {
        if record.removed {
            return Err(SlotError::Removed);
        }
        Ok(Self { slot, record })
    }

    /// Tombstones the instance; later writers get [`SlotError::Removed`]
    pub fn mark_removed(&mut self) {
        self.record.removed = true;
    }
}

impl Deref for InstanceGuard<'_> {
    type Target = PipelineInstance;

    fn deref(&self) -> &Self::Target {
        &self.record.instance
    }
}

impl DerefMut for InstanceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.record.instance
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        if !self.record.removed {
            *write(&self.slot.view) = self.record.instance.clone();
        }
    }
}

// =============================================================================
// Pipelines
// =============================================================================

/// A registered pipeline and its instances
pub struct PipelineEntry {
    name: String,
    uri: String,
    config: RwLock<Arc<PipelineConfig>>,
    instances: RwLock<BTreeMap<u64, Arc<InstanceSlot>>>,
    /// Highest id ever handed out
    last_id: AtomicU64,
    /// Minute the scheduler last started an instance in
    last_fired: Mutex<Option<DateTime<Utc>>>,
}

impl PipelineEntry {
    fn new(name: String, uri: String, config: PipelineConfig, last_id: u64) -> Self {
        Self {
            name,
            uri,
            config: RwLock::new(Arc::new(config)),
            instances: RwLock::new(BTreeMap::new()),
            last_id: AtomicU64::new(last_id),
            last_fired: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn config(&self) -> Arc<PipelineConfig> {
        read(&self.config).clone()
    }

    pub fn set_config(&self, config: PipelineConfig) {
        *write(&self.config) = Arc::new(config);
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            name: self.name.clone(),
            uri: self.uri.clone(),
            config: self.config().as_ref().clone(),
        }
    }

    /// Reserves the next instance id; ids are never reused
    pub fn next_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }

    pub fn insert_instance(&self, instance: PipelineInstance) -> Arc<InstanceSlot> {
        let slot = Arc::new(InstanceSlot::new(instance));
        write(&self.instances).insert(slot.id(), slot.clone());
        slot
    }

    pub fn instance(&self, id: u64) -> Option<Arc<InstanceSlot>> {
        read(&self.instances).get(&id).cloned()
    }

    pub fn remove_instance(&self, id: u64) -> Option<Arc<InstanceSlot>> {
        write(&self.instances).remove(&id)
    }

    /// Every slot, in id order
    pub fn slots(&self) -> Vec<Arc<InstanceSlot>> {
        read(&self.instances).values().cloned().collect()
    }

    /// Snapshots of every instance, in id order
    pub fn instances(&self) -> Vec<PipelineInstance> {
        read(&self.instances)
            .values()
            .map(|slot| slot.snapshot())
            .collect()
    }

    pub fn has_running_instances(&self) -> bool {
        read(&self.instances)
            .values()
            .any(|slot| slot.snapshot().is_running())
    }

    /// Records a scheduled start for `minute`; false if one was already made
    pub fn claim_minute(&self, minute: DateTime<Utc>) -> bool {
        let mut last = self
            .last_fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last == Some(minute) {
            return false;
        }
        *last = Some(minute);
        true
    }
}

/// All registered pipelines, in name order
#[derive(Default)]
pub struct Store {
    pipelines: RwLock<BTreeMap<String, Arc<PipelineEntry>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pipeline; returns `None` when the name is taken
    pub fn insert(&self, pipeline: Pipeline) -> Option<Arc<PipelineEntry>> {
        let mut pipelines = write(&self.pipelines);
        if pipelines.contains_key(&pipeline.name) {
            return None;
        }
        let entry = Arc::new(PipelineEntry::new(
            pipeline.name.clone(),
            pipeline.uri,
            pipeline.config,
            0,
        ));
        pipelines.insert(pipeline.name, entry.clone());
        Some(entry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PipelineEntry>> {
        read(&self.pipelines).get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<PipelineEntry>> {
        write(&self.pipelines).remove(name)
    }

    /// Every pipeline, in name order
    pub fn entries(&self) -> Vec<Arc<PipelineEntry>> {
        read(&self.pipelines).values().cloned().collect()
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Captures the current contents of the store
    pub fn checkpoint(&self) -> Checkpoint {
        let pipelines = self
            .entries()
            .iter()
            .map(|entry| PipelineRecord {
                name: entry.name.clone(),
                uri: entry.uri.clone(),
                config: entry.config().as_ref().clone(),
                last_id: entry.last_id(),
                instances: entry.instances(),
            })
            .collect();

        Checkpoint {
            saved_at: Utc::now(),
            pipelines,
        }
    }

    /// Rebuilds a store from a checkpoint
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        let store = Self::new();
        {
            let mut pipelines = write(&store.pipelines);
            for record in checkpoint.pipelines {
                let last_id = record
                    .instances
                    .iter()
                    .map(|i| i.id)
                    .fold(record.last_id, u64::max);
                let entry = PipelineEntry::new(record.name.clone(), record.uri, record.config, last_id);
                for instance in record.instances {
                    entry.insert_instance(instance);
                }
                pipelines.insert(record.name, Arc::new(entry));
            }
        }
        store
    }

    /// Writes a checkpoint to `path`, replacing the previous one atomically
    pub async fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(&self.checkpoint())?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Loads a store from a checkpoint file
    pub async fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = tokio::fs::read(path).await?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        Ok(Self::from_checkpoint(checkpoint))
    }
}

/// Serialized form of the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saved_at: DateTime<Utc>,
    pub pipelines: Vec<PipelineRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub name: String,
    pub uri: String,
    pub config: PipelineConfig,
    #[serde(default)]
    pub last_id: u64,
    #[serde(default)]
    pub instances: Vec<PipelineInstance>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
