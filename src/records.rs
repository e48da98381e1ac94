use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{Stage, Uid};
use crate::error::BeaconError;
use crate::store;

/// One ingested structure. Stage timestamps are the durable completion
/// signal: each is set once, the first time its stage succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub uid: Uid,
    pub original_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub pdb_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mmcif_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub qmean_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub model_data_created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub identity: Option<f64>,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub oligo_state: Option<String>,
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub qmean_version: Option<String>,
    #[serde(default)]
    pub qmean_avg_local_score: Option<f64>,
    #[serde(default)]
    pub model_data: Option<Value>,
}

impl ModelRecord {
    pub fn new(uid: Uid, original_path: String, now: DateTime<Utc>) -> Self {
        Self {
            uid,
            original_path,
            created_at: now,
            updated_at: now,
            pdb_created_at: None,
            mmcif_created_at: None,
            qmean_created_at: None,
            model_data_created_at: None,
            identity: None,
            similarity: None,
            oligo_state: None,
            coverage: None,
            qmean_version: None,
            qmean_avg_local_score: None,
            model_data: None,
        }
    }

    pub fn stage_completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Pdb => self.pdb_created_at,
            Stage::Mmcif => self.mmcif_created_at,
            Stage::Qmean => self.qmean_created_at,
            Stage::ModelData => self.model_data_created_at,
        }
    }

    /// Returns `false` when the stage was already complete; the original
    /// timestamp is kept in that case.
    pub fn mark_stage(&mut self, stage: Stage, at: DateTime<Utc>) -> bool {
        let slot = match stage {
            Stage::Pdb => &mut self.pdb_created_at,
            Stage::Mmcif => &mut self.mmcif_created_at,
            Stage::Qmean => &mut self.qmean_created_at,
            Stage::ModelData => &mut self.model_data_created_at,
        };
        self.updated_at = at;
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }
}

pub trait RecordStore: Send + Sync {
    fn get(&self, uid: &Uid) -> Result<Option<ModelRecord>, BeaconError>;

    /// Insert-or-fetch. An existing record gets the new `original_path` and
    /// a fresh `updated_at`.
    fn get_or_create(&self, uid: &Uid, original_path: &str) -> Result<ModelRecord, BeaconError>;

    /// Read, apply `apply`, mark `stage` complete and write back as one
    /// commit. Fails with `RecordNotFound` for an unknown uid.
    fn commit_stage(
        &self,
        uid: &Uid,
        stage: Stage,
        at: DateTime<Utc>,
        apply: &dyn Fn(&mut ModelRecord),
    ) -> Result<ModelRecord, BeaconError>;

    fn update_stage(
        &self,
        uid: &Uid,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> Result<ModelRecord, BeaconError> {
        self.commit_stage(uid, stage, at, &|_| {})
    }

    fn list(&self) -> Result<Vec<ModelRecord>, BeaconError>;
}

/// File-backed store: one JSON document per uid under
/// `{root}/{uid[0:2]}/{uid}.json`, replaced atomically on every commit.
pub struct JsonRecordStore {
    root: Utf8PathBuf,
    locks: Mutex<HashMap<Uid, Arc<Mutex<()>>>>,
}

impl JsonRecordStore {
    pub fn open(root: Utf8PathBuf) -> Result<Self, BeaconError> {
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| BeaconError::Filesystem(format!("create {root}: {err}")))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn record_path(&self, uid: &Uid) -> Utf8PathBuf {
        store::resolve_path(&self.root, uid, ".json")
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<Uid, Arc<Mutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `op` holding the lock for `uid`. The lock entry is dropped again
    /// once no other caller holds or waits on it.
    fn with_uid_lock<R>(
        &self,
        uid: &Uid,
        op: impl FnOnce() -> Result<R, BeaconError>,
    ) -> Result<R, BeaconError> {
        let lock = self
            .lock_table()
            .entry(uid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock_guard(&lock);
            op()
        };
        let mut locks = self.lock_table();
        // One reference in the table, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(uid);
        }
        result
    }

    fn read(&self, uid: &Uid) -> Result<Option<ModelRecord>, BeaconError> {
        let path = self.record_path(uid);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    fn write(&self, record: &ModelRecord) -> Result<(), BeaconError> {
        let path = store::ensure_path(&self.root, &record.uid, ".json")?;
        store::write_json_atomic(&path, record)
    }
}

fn lock_guard(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_record(path: &Utf8Path) -> Result<ModelRecord, BeaconError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| BeaconError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content)
        .map_err(|err| BeaconError::Filesystem(format!("corrupt record {path}: {err}")))
}

impl RecordStore for JsonRecordStore {
    fn get(&self, uid: &Uid) -> Result<Option<ModelRecord>, BeaconError> {
        self.with_uid_lock(uid, || self.read(uid))
    }

    fn get_or_create(&self, uid: &Uid, original_path: &str) -> Result<ModelRecord, BeaconError> {
        self.with_uid_lock(uid, || {
            let now = Utc::now();
            let record = match self.read(uid)? {
                Some(mut record) => {
                    debug!(uid = %uid, "updating existing model record");
                    record.original_path = original_path.to_string();
                    record.updated_at = now;
                    record
                }
                None => {
                    debug!(uid = %uid, "creating model record");
                    ModelRecord::new(uid.clone(), original_path.to_string(), now)
                }
            };
            self.write(&record)?;
            Ok(record)
        })
    }

    fn commit_stage(
        &self,
        uid: &Uid,
        stage: Stage,
        at: DateTime<Utc>,
        apply: &dyn Fn(&mut ModelRecord),
    ) -> Result<ModelRecord, BeaconError> {
        self.with_uid_lock(uid, || {
            let mut record = self
                .read(uid)?
                .ok_or_else(|| BeaconError::RecordNotFound(uid.to_string()))?;
            apply(&mut record);
            if !record.mark_stage(stage, at) {
                debug!(uid = %uid, stage = %stage, "stage already complete");
            }
            self.write(&record)?;
            Ok(record)
        })
    }

    fn list(&self) -> Result<Vec<ModelRecord>, BeaconError> {
        let mut records = Vec::new();
        let shards = fs::read_dir(self.root.as_std_path())
            .map_err(|err| BeaconError::Filesystem(format!("read {}: {err}", self.root)))?;
        for shard in shards {
            let shard = shard.map_err(|err| BeaconError::Filesystem(err.to_string()))?;
            if !shard.path().is_dir() {
                continue;
            }
            let entries = fs::read_dir(shard.path())
                .map_err(|err| BeaconError::Filesystem(err.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|err| BeaconError::Filesystem(err.to_string()))?;
                let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                    continue;
                };
                if path.extension() == Some("json") {
                    records.push(read_record(&path)?);
                }
            }
        }
        records.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(records)
    }
}
