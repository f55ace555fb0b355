use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Flat get-all / replace-all persistence. No queries, no partial updates.
#[async_trait]
pub trait RecordStore<T>: Send + Sync {
    async fn load_all(&self) -> Result<Vec<T>, StoreError>;
    async fn replace_all(&self, records: &[T]) -> Result<(), StoreError>;
}

/// A JSON document `{"<key>": [records...]}` on disk.
pub struct JsonFileStore<T> {
    path: PathBuf,
    key: String,
    _records: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            _records: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> RecordStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load_all(&self) -> Result<Vec<T>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let mut document: Value = serde_json::from_slice(&bytes)?;
        let records = match document.get_mut(&self.key).map(Value::take) {
            Some(records @ Value::Array(_)) => records,
            Some(Value::Null) | None => return Ok(Vec::new()),
            Some(_) => {
                return Err(StoreError::Malformed {
                    path: self.path.display().to_string(),
                    key: self.key.clone(),
                });
            }
        };
        Ok(serde_json::from_value(records)?)
    }

    async fn replace_all(&self, records: &[T]) -> Result<(), StoreError> {
        let mut document = Map::new();
        document.insert(self.key.clone(), serde_json::to_value(records)?);
        let bytes = serde_json::to_vec_pretty(&Value::Object(document))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Process-local store, for tests and throwaway sessions.
pub struct MemoryStore<T> {
    records: Mutex<Vec<T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    pub fn with_records(records: Vec<T>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> RecordStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync,
{
    async fn load_all(&self) -> Result<Vec<T>, StoreError> {
        Ok(self
            .records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default())
    }

    async fn replace_all(&self, records: &[T]) -> Result<(), StoreError> {
        if let Ok(mut stored) = self.records.lock() {
            *stored = records.to_vec();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        text: String,
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::new(dir.path().join("notes.json"), "notes");
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_round_trips_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notes.json");
        let store = JsonFileStore::new(&path, "notes");
        let notes = vec![
            Note { id: 1, text: "a".into() },
            Note { id: 2, text: "b".into() },
        ];
        store.replace_all(&notes).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), notes);

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["notes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn wrong_document_shape_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.json");
        std::fs::write(&path, r#"{"notes": {"id": 1}}"#).unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::new(&path, "notes");
        assert!(matches!(store.load_all().await, Err(StoreError::Malformed { .. })));
    }
}
