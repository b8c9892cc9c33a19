use async_trait::async_trait;
use bson::{Bson, Document, oid::ObjectId};
use tokio::sync::Mutex;

use super::{Backend, BackendError, ChunkRecord};

#[derive(Default)]
struct State {
    entries: Vec<Document>,
    chunks: Vec<ChunkRecord>,
}

/// In-process backend for tests and local development.
///
/// Holds the same BSON documents the MongoDB backend would store, so the
/// decode paths above it are exercised against identical shapes. Filename
/// and `(owner, index)` uniqueness are enforced the way the real
/// backend's indexes do.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn has_filename(doc: &Document, filename: &str) -> bool {
    doc.get_str("filename").ok() == Some(filename)
}

fn has_id(doc: &Document, id: &ObjectId) -> bool {
    doc.get_object_id("_id").ok() == Some(*id)
}

fn int_field(doc: &Document, key: &str) -> i64 {
    match doc.get(key) {
        Some(Bson::Int32(v)) => *v as i64,
        Some(Bson::Int64(v)) => *v,
        _ => 0,
    }
}

fn int_bson(value: i64) -> Bson {
    i32::try_from(value)
        .map(Bson::Int32)
        .unwrap_or(Bson::Int64(value))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn reconnect(&self) -> Result<(), BackendError> {
        // Nothing to re-establish; the store lives in process.
        Ok(())
    }

    async fn insert_entry(&self, doc: &Document) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let filename = doc.get_str("filename").unwrap_or_default();
        if state.entries.iter().any(|e| has_filename(e, filename)) {
            return Err(BackendError::Duplicate(format!(
                "entry {filename} already exists"
            )));
        }
        let mut doc = doc.clone();
        if !doc.contains_key("_id") {
            doc.insert("_id", ObjectId::new());
        }
        state.entries.push(doc);
        Ok(())
    }

    async fn find_entry(&self, filename: &str) -> Result<Option<Document>, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .find(|e| has_filename(e, filename))
            .cloned())
    }

    async fn find_and_lock_entry(
        &self,
        filename: &str,
        lock_id: &str,
    ) -> Result<Option<Document>, BackendError> {
        let mut state = self.state.lock().await;
        for doc in &mut state.entries {
            if !has_filename(doc, filename) {
                continue;
            }
            return match doc.get("lock") {
                Some(Bson::String(holder)) if holder != lock_id => Ok(None),
                Some(Bson::String(_)) | None => {
                    doc.insert("lock", lock_id);
                    Ok(Some(doc.clone()))
                }
                Some(_) => Ok(None),
            };
        }
        Ok(None)
    }

    async fn clear_lock(&self, filename: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.entries.iter_mut().find(|e| has_filename(e, filename)) {
            doc.remove("lock");
        }
        Ok(())
    }

    async fn entries_in_directory(&self, directory: &str) -> Result<Vec<Document>, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.get_str("directory").ok() == Some(directory))
            .cloned()
            .collect())
    }

    async fn count_children(&self, directory: &str) -> Result<u64, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.get_str("directory").ok() == Some(directory))
            .count() as u64)
    }

    async fn delete_entry(&self, id: &ObjectId) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.entries.retain(|e| !has_id(e, id));
        Ok(())
    }

    async fn rename_entry(&self, id: &ObjectId, new_filename: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.entries.iter_mut().find(|e| has_id(e, id)) {
            doc.insert("filename", new_filename);
        }
        Ok(())
    }

    async fn bump_link_count(&self, filename: &str, delta: i64) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.entries.iter_mut().find(|e| has_filename(e, filename)) {
            if !doc.contains_key("metadata") {
                doc.insert("metadata", Document::new());
            }
            if let Ok(metadata) = doc.get_document_mut("metadata") {
                let count = int_field(metadata, "st_nlink") + delta;
                metadata.insert("st_nlink", int_bson(count));
            }
        }
        Ok(())
    }

    async fn replace_entry_fields(
        &self,
        id: &ObjectId,
        metadata: &Document,
        attrs: &Document,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.entries.iter_mut().find(|e| has_id(e, id)) {
            doc.insert("metadata", metadata.clone());
            doc.insert("attrs", attrs.clone());
        }
        Ok(())
    }

    async fn set_entry_length(&self, id: &ObjectId, length: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.entries.iter_mut().find(|e| has_id(e, id)) {
            doc.insert("length", length as i64);
            if !doc.contains_key("metadata") {
                doc.insert("metadata", Document::new());
            }
            if let Ok(metadata) = doc.get_document_mut("metadata") {
                metadata.insert("st_size", length as i64);
            }
        }
        Ok(())
    }

    async fn chunks_in_range(
        &self,
        owner: &ObjectId,
        first: u64,
        last: u64,
    ) -> Result<Vec<ChunkRecord>, BackendError> {
        let state = self.state.lock().await;
        let mut chunks: Vec<ChunkRecord> = state
            .chunks
            .iter()
            .filter(|c| c.owner == *owner && c.index >= first && c.index <= last)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    async fn insert_chunk(
        &self,
        owner: &ObjectId,
        index: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state
            .chunks
            .iter()
            .any(|c| c.owner == *owner && c.index == index)
        {
            return Err(BackendError::Duplicate(format!(
                "chunk {index} of {owner} already exists"
            )));
        }
        state.chunks.push(ChunkRecord {
            id: ObjectId::new(),
            owner: *owner,
            index,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn replace_chunk_data(&self, id: &ObjectId, data: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(chunk) = state.chunks.iter_mut().find(|c| c.id == *id) {
            chunk.data = data.to_vec();
        }
        Ok(())
    }

    async fn delete_chunks_from(&self, owner: &ObjectId, first: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state
            .chunks
            .retain(|c| c.owner != *owner || c.index < first);
        Ok(())
    }

    async fn count_entries(&self) -> Result<u64, BackendError> {
        let state = self.state.lock().await;
        Ok(state.entries.len() as u64)
    }

    async fn count_chunks(&self) -> Result<u64, BackendError> {
        let state = self.state.lock().await;
        Ok(state.chunks.len() as u64)
    }

    async fn purge(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.chunks.clear();
        Ok(())
    }
}
