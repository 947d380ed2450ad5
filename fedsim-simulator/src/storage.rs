//! The checkpoint store.
//!
//! The simulator keeps three checkpoints per run in one directory: `init`
//! (the global weights before the first round), `best` (the highest
//! scoring global weights so far) and `latest` (the most recent round's
//! global weights). A checkpoint is a weight record file plus a JSON
//! metadata file; both are written to a temporary name and renamed into
//! place, so a crash never leaves a half-written checkpoint behind.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fedsim_core::record::WeightRecord;

#[derive(Debug, Error)]
/// An error related to reading or writing checkpoints.
pub enum StorageError {
    #[error("checkpoint {0} does not exist")]
    NotFound(CheckpointName),
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed checkpoint metadata: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("malformed checkpoint record: {0}")]
    Record(#[from] fedsim_core::record::CodecError),
}

/// The name of one of the three checkpoints of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CheckpointName {
    #[display(fmt = "init")]
    Init,
    #[display(fmt = "best")]
    Best,
    #[display(fmt = "latest")]
    Latest,
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown checkpoint name {0:?}, expected init, best or latest")]
/// Error returned for a string naming no checkpoint.
pub struct UnknownCheckpointName(String);

impl FromStr for CheckpointName {
    type Err = UnknownCheckpointName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(CheckpointName::Init),
            "best" => Ok(CheckpointName::Best),
            "latest" => Ok(CheckpointName::Latest),
            other => Err(UnknownCheckpointName(other.to_string())),
        }
    }
}

/// Metadata stored next to a checkpoint's weight record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// The round after which the checkpoint was taken; zero for `init`.
    pub round: u32,
    /// The aggregated validation score; absent for `init`.
    pub score: Option<f64>,
    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,
}

impl CheckpointMeta {
    /// Creates metadata stamped with the current time.
    pub fn new(round: u32, score: Option<f64>) -> Self {
        Self {
            round,
            score,
            timestamp: Utc::now(),
        }
    }
}

/// A directory-backed store for the init/best/latest checkpoints.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Opens a store at `dir`, creating the directory if necessary.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Gets the directory this store writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: CheckpointName) -> PathBuf {
        self.dir.join(format!("{}.fwr", name))
    }

    fn meta_path(&self, name: CheckpointName) -> PathBuf {
        self.dir.join(format!("{}.meta.json", name))
    }

    /// Checks whether a checkpoint exists.
    pub fn exists(&self, name: CheckpointName) -> bool {
        self.record_path(name).is_file() && self.meta_path(name).is_file()
    }

    /// Saves a checkpoint, atomically replacing any previous one of the
    /// same name.
    pub fn save(
        &self,
        name: CheckpointName,
        record: &WeightRecord,
        meta: &CheckpointMeta,
    ) -> Result<(), StorageError> {
        self.write_atomic(&self.record_path(name), record.as_slice())?;
        let meta_bytes = serde_json::to_vec_pretty(meta)?;
        self.write_atomic(&self.meta_path(name), &meta_bytes)?;
        debug!(checkpoint = %name, round = meta.round, "checkpoint written");
        Ok(())
    }

    /// Loads a checkpoint.
    pub fn load(&self, name: CheckpointName) -> Result<(WeightRecord, CheckpointMeta), StorageError> {
        if !self.exists(name) {
            return Err(StorageError::NotFound(name));
        }
        let record_path = self.record_path(name);
        let bytes = fs::read(&record_path).map_err(|source| StorageError::Io {
            path: record_path,
            source,
        })?;
        let record = WeightRecord::from_bytes(bytes)?;

        let meta_path = self.meta_path(name);
        let meta_bytes = fs::read(&meta_path).map_err(|source| StorageError::Io {
            path: meta_path,
            source,
        })?;
        let meta = serde_json::from_slice(&meta_bytes)?;
        Ok((record, meta))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsim_core::{
        pipeline::Pipeline,
        record,
        tensor::{Tensor, TensorDict},
    };

    fn temp_store(tag: &str) -> CheckpointStore {
        let dir = std::env::temp_dir().join(format!(
            "fedsim-store-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        CheckpointStore::new(dir).unwrap()
    }

    fn record() -> WeightRecord {
        let mut dict = TensorDict::new();
        dict.insert("w", Tensor::scalar(1.5));
        record::encode(&dict, &Pipeline::identity()).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = temp_store("roundtrip");
        let meta = CheckpointMeta::new(3, Some(0.75));
        assert!(!store.exists(CheckpointName::Latest));

        store.save(CheckpointName::Latest, &record(), &meta).unwrap();
        assert!(store.exists(CheckpointName::Latest));

        let (loaded_record, loaded_meta) = store.load(CheckpointName::Latest).unwrap();
        assert_eq!(loaded_record, record());
        assert_eq!(loaded_meta, meta);

        fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn test_save_replaces_previous_checkpoint() {
        let store = temp_store("replace");
        store
            .save(CheckpointName::Best, &record(), &CheckpointMeta::new(1, Some(0.5)))
            .unwrap();
        store
            .save(CheckpointName::Best, &record(), &CheckpointMeta::new(2, Some(0.8)))
            .unwrap();

        let (_, meta) = store.load(CheckpointName::Best).unwrap();
        assert_eq!(meta.round, 2);
        assert_eq!(meta.score, Some(0.8));

        fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let store = temp_store("missing");
        assert!(matches!(
            store.load(CheckpointName::Init).unwrap_err(),
            StorageError::NotFound(CheckpointName::Init)
        ));
        fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let store = temp_store("corrupt");
        store
            .save(CheckpointName::Init, &record(), &CheckpointMeta::new(0, None))
            .unwrap();
        fs::write(store.dir().join("init.fwr"), b"garbage").unwrap();
        assert!(matches!(
            store.load(CheckpointName::Init).unwrap_err(),
            StorageError::Record(_)
        ));
        fs::remove_dir_all(store.dir()).unwrap();
    }
}
