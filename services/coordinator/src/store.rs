use anyhow::{Context, Result};
use round_core::federated_learning::CollaboratorError;
use round_core::{Model, ModelStore};
use tracing::warn;

const KEY_PREFIX: &str = "global_model_v";

/// Model artifacts in sled, one JSON document per `global_model_v{N}` key.
pub struct SledModelStore { db: sled::Db }

impl SledModelStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).with_context(|| format!("open model store at {path}"))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn from_db(db: sled::Db) -> Self { Self { db } }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("flush model store")?;
        Ok(())
    }
}

impl ModelStore for SledModelStore {
    fn persist(&self, model: &Model) -> Result<(), CollaboratorError> {
        let bytes = serde_json::to_vec(model)?;
        self.db.insert(model.storage_key(), bytes).map_err(|e| CollaboratorError::Persist(e.to_string()))?;
        Ok(())
    }

    fn latest(&self) -> Result<Option<Model>, CollaboratorError> {
        // keys sort lexically, so pick the highest parsed version rather than the last key
        let mut best: Option<(u64, sled::IVec)> = None;
        for kv in self.db.scan_prefix(KEY_PREFIX) {
            let (k, v) = kv.map_err(|e| CollaboratorError::Persist(e.to_string()))?;
            let version = std::str::from_utf8(&k).ok().and_then(|s| s.strip_prefix(KEY_PREFIX)).and_then(|s| s.parse::<u64>().ok());
            match version {
                Some(ver) if best.as_ref().map_or(true, |(b, _)| ver > *b) => best = Some((ver, v)),
                Some(_) => {}
                None => warn!(key = %String::from_utf8_lossy(&k), "unrecognized_model_key"),
            }
        }
        match best {
            Some((_, bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
