use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, doc, oid::ObjectId};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use tracing::info;

use super::{Backend, BackendError, ChunkRecord};
use crate::config::MongoSettings;

/// Keep server selection short so an unreachable backend is reported to
/// the retry loop quickly instead of stalling a mount operation.
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Production backend over the MongoDB driver.
///
/// The driver client is held behind an `ArcSwap`: `reconnect` builds a
/// fresh client and swaps it in, and every operation re-reads the current
/// handle, so all callers sharing this backend observe the replacement
/// without coordination.
pub struct MongoBackend {
    client: ArcSwap<Client>,
    uri: String,
    database: String,
    entries_name: String,
    chunks_name: String,
}

impl MongoBackend {
    pub async fn connect(settings: &MongoSettings) -> Result<Self, BackendError> {
        let uri = settings.uri();
        let client = Self::build_client(&uri).await?;
        let backend = Self {
            client: ArcSwap::from_pointee(client),
            uri,
            database: settings.database.clone(),
            entries_name: format!("{}files", settings.collection_prefix),
            chunks_name: format!("{}chunks", settings.collection_prefix),
        };
        backend.prepare().await?;
        info!(
            "MongoBackend::connect: connected to {} (database={})",
            backend.uri, backend.database
        );
        Ok(backend)
    }

    async fn build_client(uri: &str) -> Result<Client, BackendError> {
        let mut options = ClientOptions::parse(uri).await.map_err(classify)?;
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        Client::with_options(options).map_err(classify)
    }

    /// Indexes backing the engine's uniqueness guarantees: `filename` is
    /// the namespace key, `(files_id, n)` addresses a chunk.
    async fn prepare(&self) -> Result<(), BackendError> {
        let unique = IndexOptions::builder().unique(true).build();
        let by_filename = IndexModel::builder()
            .keys(doc! { "filename": 1 })
            .options(unique.clone())
            .build();
        self.entries()
            .create_index(by_filename)
            .await
            .map_err(classify)?;
        let by_owner_index = IndexModel::builder()
            .keys(doc! { "files_id": 1, "n": 1 })
            .options(unique)
            .build();
        self.chunks()
            .create_index(by_owner_index)
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn entries(&self) -> Collection<Document> {
        self.client
            .load()
            .database(&self.database)
            .collection(&self.entries_name)
    }

    fn chunks(&self) -> Collection<Document> {
        self.client
            .load()
            .database(&self.database)
            .collection(&self.chunks_name)
    }

    async fn collect_chunks(
        &self,
        owner: &ObjectId,
        filter: Document,
    ) -> Result<Vec<ChunkRecord>, BackendError> {
        let mut cursor = self
            .chunks()
            .find(filter)
            .sort(doc! { "n": 1 })
            .await
            .map_err(classify)?;
        let mut chunks = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(classify)? {
            chunks.push(decode_chunk(owner, &doc)?);
        }
        Ok(chunks)
    }
}

#[async_trait]
impl Backend for MongoBackend {
    async fn reconnect(&self) -> Result<(), BackendError> {
        let client = Self::build_client(&self.uri).await?;
        self.client.store(Arc::new(client));
        Ok(())
    }

    async fn insert_entry(&self, doc: &Document) -> Result<(), BackendError> {
        self.entries()
            .insert_one(doc.clone())
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn find_entry(&self, filename: &str) -> Result<Option<Document>, BackendError> {
        self.entries()
            .find_one(doc! { "filename": filename })
            .await
            .map_err(classify)
    }

    async fn find_and_lock_entry(
        &self,
        filename: &str,
        lock_id: &str,
    ) -> Result<Option<Document>, BackendError> {
        let filter = doc! {
            "filename": filename,
            "$or": [
                { "lock": { "$exists": false } },
                { "lock": lock_id },
            ],
        };
        self.entries()
            .find_one_and_update(filter, doc! { "$set": { "lock": lock_id } })
            .return_document(ReturnDocument::After)
            .await
            .map_err(classify)
    }

    async fn clear_lock(&self, filename: &str) -> Result<(), BackendError> {
        self.entries()
            .update_one(
                doc! { "filename": filename },
                doc! { "$unset": { "lock": "" } },
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn entries_in_directory(&self, directory: &str) -> Result<Vec<Document>, BackendError> {
        // Large directories may take longer to walk than the server's
        // default cursor idle timeout allows.
        let mut cursor = self
            .entries()
            .find(doc! { "directory": directory })
            .no_cursor_timeout(true)
            .await
            .map_err(classify)?;
        let mut docs = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(classify)? {
            docs.push(doc);
        }
        Ok(docs)
    }

    async fn count_children(&self, directory: &str) -> Result<u64, BackendError> {
        self.entries()
            .count_documents(doc! { "directory": directory })
            .await
            .map_err(classify)
    }

    async fn delete_entry(&self, id: &ObjectId) -> Result<(), BackendError> {
        self.entries()
            .delete_one(doc! { "_id": *id })
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn rename_entry(&self, id: &ObjectId, new_filename: &str) -> Result<(), BackendError> {
        self.entries()
            .update_one(
                doc! { "_id": *id },
                doc! { "$set": { "filename": new_filename } },
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn bump_link_count(&self, filename: &str, delta: i64) -> Result<(), BackendError> {
        self.entries()
            .update_one(
                doc! { "filename": filename },
                doc! { "$inc": { "metadata.st_nlink": delta } },
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn replace_entry_fields(
        &self,
        id: &ObjectId,
        metadata: &Document,
        attrs: &Document,
    ) -> Result<(), BackendError> {
        self.entries()
            .update_one(
                doc! { "_id": *id },
                doc! { "$set": { "metadata": metadata.clone(), "attrs": attrs.clone() } },
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn set_entry_length(&self, id: &ObjectId, length: u64) -> Result<(), BackendError> {
        self.entries()
            .update_one(
                doc! { "_id": *id },
                doc! { "$set": { "length": length as i64, "metadata.st_size": length as i64 } },
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn chunks_in_range(
        &self,
        owner: &ObjectId,
        first: u64,
        last: u64,
    ) -> Result<Vec<ChunkRecord>, BackendError> {
        let filter = doc! {
            "files_id": *owner,
            "n": { "$gte": first as i64, "$lte": last as i64 },
        };
        self.collect_chunks(owner, filter).await
    }

    async fn insert_chunk(
        &self,
        owner: &ObjectId,
        index: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let doc = doc! {
            "files_id": *owner,
            "n": index as i64,
            "data": Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: data.to_vec(),
            }),
        };
        self.chunks()
            .insert_one(doc)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn replace_chunk_data(&self, id: &ObjectId, data: &[u8]) -> Result<(), BackendError> {
        let payload = Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: data.to_vec(),
        });
        self.chunks()
            .update_one(doc! { "_id": *id }, doc! { "$set": { "data": payload } })
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_chunks_from(&self, owner: &ObjectId, first: u64) -> Result<(), BackendError> {
        self.chunks()
            .delete_many(doc! { "files_id": *owner, "n": { "$gte": first as i64 } })
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn count_entries(&self) -> Result<u64, BackendError> {
        self.entries()
            .count_documents(doc! {})
            .await
            .map_err(classify)
    }

    async fn count_chunks(&self) -> Result<u64, BackendError> {
        self.chunks().count_documents(doc! {}).await.map_err(classify)
    }

    async fn purge(&self) -> Result<(), BackendError> {
        self.entries().drop().await.map_err(classify)?;
        self.chunks().drop().await.map_err(classify)?;
        Ok(())
    }
}

fn decode_chunk(owner: &ObjectId, doc: &Document) -> Result<ChunkRecord, BackendError> {
    let id = doc
        .get_object_id("_id")
        .map_err(|e| BackendError::Other(format!("chunk document without _id: {e}")))?;
    let index = match doc.get("n") {
        Some(Bson::Int32(n)) if *n >= 0 => *n as u64,
        Some(Bson::Int64(n)) if *n >= 0 => *n as u64,
        other => {
            return Err(BackendError::Other(format!(
                "chunk {id} has an invalid index: {other:?}"
            )));
        }
    };
    let data = doc
        .get_binary_generic("data")
        .map_err(|e| BackendError::Other(format!("chunk {id} has no binary payload: {e}")))?
        .clone();
    Ok(ChunkRecord {
        id,
        owner: *owner,
        index,
        data,
    })
}

/// Sort driver failures into the retry taxonomy: connectivity loss is
/// transient, a duplicate key is a distinct outcome, the rest surface
/// as-is.
fn classify(err: mongodb::error::Error) -> BackendError {
    use mongodb::error::{ErrorKind, WriteFailure};

    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == 11000 => {
            BackendError::Duplicate(err.to_string())
        }
        ErrorKind::Command(command) if command.code == 11000 => {
            BackendError::Duplicate(err.to_string())
        }
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => BackendError::Unreachable(err.to_string()),
        _ => BackendError::Other(err.to_string()),
    }
}
