use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::backend::Connection;
use crate::fs::entry::FsEntry;
use crate::fs::errors::FsError;

/// File content as fixed-size chunk documents keyed by the owning
/// entry's id.
#[derive(Clone)]
pub struct ChunkStore {
    conn: Arc<Connection>,
}

impl ChunkStore {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Fetch the chunk run covering `offset..offset + size`, concatenated.
    ///
    /// Granularity is the chunk boundary: the result starts at the
    /// beginning of the chunk containing `offset` and runs to the end of
    /// the chunk containing `offset + size`, so it is usually longer than
    /// `size`. The caller slices out the exact window.
    pub async fn read(&self, entry: &FsEntry, offset: u64, size: u64) -> Result<Bytes, FsError> {
        let chunk_size = entry.chunk_size();
        let first = offset / chunk_size;
        let last = (offset + size) / chunk_size;
        let backend = self.conn.backend();
        let chunks = self
            .conn
            .run("chunk fetch", || {
                backend.chunks_in_range(&entry.id, first, last)
            })
            .await?;
        let mut content = BytesMut::with_capacity(chunks.iter().map(|c| c.data.len()).sum());
        for chunk in &chunks {
            content.extend_from_slice(&chunk.data);
        }
        Ok(content.freeze())
    }

    /// Write `data` at `offset`, splicing existing chunks in place and
    /// appending fresh ones past the current end. Returns the resulting
    /// content length.
    ///
    /// Content stays contiguous: `offset` may be at most the current
    /// length, and a fresh chunk is only ever appended directly after a
    /// full one. Anything else is `InvalidOffset`. A truncate past the
    /// end records a length without materializing chunks, so the guard
    /// cannot trust `length` alone; the second check keeps writes aimed
    /// into that hollow tail from opening an index gap.
    pub async fn write(&self, entry: &FsEntry, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        debug!(
            "ChunkStore::write({}, offset {}, {} bytes)",
            entry.filename,
            offset,
            data.len()
        );
        let length = entry.length();
        let chunk_size = entry.chunk_size();
        if offset > length {
            return Err(FsError::InvalidOffset { offset, length });
        }
        if data.is_empty() {
            return Ok(length);
        }

        let backend = self.conn.backend();
        let first = offset / chunk_size;
        let last = (offset + data.len() as u64) / chunk_size;
        // One chunk before the span: its presence decides whether an
        // append at `first` is contiguous.
        let fetch_from = first.saturating_sub(1);
        let existing = self
            .conn
            .run("chunk fetch for write", || {
                backend.chunks_in_range(&entry.id, fetch_from, last)
            })
            .await?;

        let splice_from = existing.iter().position(|c| c.index == first);
        if splice_from.is_none() {
            let boundary_ok = offset % chunk_size == 0
                && (first == 0
                    || existing.last().is_some_and(|c| {
                        c.index == first - 1 && c.data.len() == chunk_size as usize
                    }));
            if !boundary_ok {
                return Err(FsError::InvalidOffset { offset, length });
            }
        }

        let mut remaining = data;
        let mut start_in_chunk = (offset % chunk_size) as usize;
        let mut next_index = first;
        for chunk in existing.iter().skip(splice_from.unwrap_or(existing.len())) {
            if remaining.is_empty() {
                break;
            }
            let take = remaining.len().min(chunk_size as usize - start_in_chunk);
            let mut payload = chunk.data.clone();
            if payload.len() < start_in_chunk + take {
                payload.resize(start_in_chunk + take, 0);
            }
            payload[start_in_chunk..start_in_chunk + take].copy_from_slice(&remaining[..take]);
            self.conn
                .run("chunk update", || {
                    backend.replace_chunk_data(&chunk.id, &payload)
                })
                .await?;
            remaining = &remaining[take..];
            start_in_chunk = 0;
            next_index = chunk.index + 1;
        }
        // Past the last existing chunk the write is always chunk-aligned.
        for piece in remaining.chunks(chunk_size as usize) {
            self.conn
                .run("chunk insert", || {
                    backend.insert_chunk(&entry.id, next_index, piece)
                })
                .await?;
            next_index += 1;
        }

        let new_length = length.max(offset + data.len() as u64);
        self.set_length(entry, new_length).await?;
        Ok(new_length)
    }

    /// Cut the content down (or out) to `new_length` bytes, or record a
    /// larger length without materializing anything. Shrinking deletes
    /// the chunks wholly past the new end and trims the one straddling
    /// it.
    pub async fn truncate(&self, entry: &FsEntry, new_length: u64) -> Result<(), FsError> {
        debug!("ChunkStore::truncate({}, {})", entry.filename, new_length);
        let chunk_size = entry.chunk_size();
        let backend = self.conn.backend();
        if new_length < entry.length() {
            let keep = new_length.div_ceil(chunk_size);
            self.conn
                .run("chunk delete", || {
                    backend.delete_chunks_from(&entry.id, keep)
                })
                .await?;
            let tail = (new_length % chunk_size) as usize;
            if tail != 0 {
                let last = self
                    .conn
                    .run("tail fetch", || {
                        backend.chunks_in_range(&entry.id, keep - 1, keep - 1)
                    })
                    .await?;
                if let Some(chunk) = last.first()
                    && chunk.data.len() > tail
                {
                    self.conn
                        .run("tail trim", || {
                            backend.replace_chunk_data(&chunk.id, &chunk.data[..tail])
                        })
                        .await?;
                }
            }
        }
        self.set_length(entry, new_length).await
    }

    /// Drop every chunk the entry owns. The entry document itself stays.
    pub async fn release(&self, entry: &FsEntry) -> Result<(), FsError> {
        debug!("ChunkStore::release({})", entry.filename);
        let backend = self.conn.backend();
        self.conn
            .run("chunk release", || backend.delete_chunks_from(&entry.id, 0))
            .await?;
        Ok(())
    }

    async fn set_length(&self, entry: &FsEntry, length: u64) -> Result<(), FsError> {
        let backend = self.conn.backend();
        self.conn
            .run("length update", || backend.set_entry_length(&entry.id, length))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bson::Document;
    use bson::oid::ObjectId;

    use super::*;
    use crate::backend::{Backend, BackendError, ChunkRecord, Connection, MemoryBackend};
    use crate::fs::entry::{EntryMetadata, FsEntry};

    async fn store_with_file(chunk_size: u64) -> (Arc<Connection>, ChunkStore, FsEntry) {
        let conn = Arc::new(Connection::new(
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(60),
            None,
        ));
        let store = ChunkStore::new(conn.clone());
        let entry = FsEntry::new_file("/data.bin", EntryMetadata::file(0o644, 0, 0))
            .with_chunk_size(chunk_size);
        conn.backend()
            .insert_entry(&entry.to_document().unwrap())
            .await
            .unwrap();
        (conn, store, entry)
    }

    async fn refreshed(conn: &Connection, filename: &str) -> FsEntry {
        let doc = conn.backend().find_entry(filename).await.unwrap().unwrap();
        FsEntry::decode(&doc).unwrap()
    }

    #[tokio::test]
    async fn splice_runs_across_chunk_boundaries() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"aaaabbbbcccc").await.unwrap();

        let entry = refreshed(&conn, "/data.bin").await;
        let new_length = store.write(&entry, 3, b"XXXXXX").await.unwrap();
        assert_eq!(new_length, 12);

        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(entry.length(), 12);
        assert_eq!(
            store.read(&entry, 0, 12).await.unwrap(),
            b"aaaXXXXXXccc".as_ref()
        );
    }

    #[tokio::test]
    async fn mid_chunk_append_grows_the_tail_chunk() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"aaaaab").await.unwrap();

        let entry = refreshed(&conn, "/data.bin").await;
        let new_length = store.write(&entry, 6, b"cd").await.unwrap();
        assert_eq!(new_length, 8);

        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(store.read(&entry, 0, 8).await.unwrap(), b"aaaaabcd".as_ref());
        assert_eq!(conn.backend().count_chunks().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn write_past_the_end_is_rejected() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"abcd").await.unwrap();

        let entry = refreshed(&conn, "/data.bin").await;
        let err = store.write(&entry, 6, b"late").await.unwrap_err();
        assert!(matches!(
            err,
            FsError::InvalidOffset { offset: 6, length: 4 }
        ));
        assert_eq!(conn.backend().count_chunks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn truncate_past_the_end_only_records_the_length() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"abcd").await.unwrap();

        let entry = refreshed(&conn, "/data.bin").await;
        store.truncate(&entry, 9).await.unwrap();

        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(entry.length(), 9);
        assert_eq!(conn.backend().count_chunks().await.unwrap(), 1);
        assert_eq!(store.read(&entry, 0, 9).await.unwrap(), b"abcd".as_ref());
    }

    #[tokio::test]
    async fn write_into_a_hollow_tail_is_rejected() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"abcd").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        store.truncate(&entry, 9).await.unwrap();

        // Offset 8 sits within the recorded length, but chunk 1 was
        // never materialized; writing chunk 2 would strand a hole.
        let entry = refreshed(&conn, "/data.bin").await;
        let err = store.write(&entry, 8, b"zz").await.unwrap_err();
        assert!(matches!(err, FsError::InvalidOffset { offset: 8, length: 9 }));
        // Mid-hole and not even chunk-aligned.
        let err = store.write(&entry, 6, b"zz").await.unwrap_err();
        assert!(matches!(err, FsError::InvalidOffset { offset: 6, length: 9 }));

        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(entry.length(), 9);
        assert_eq!(conn.backend().count_chunks().await.unwrap(), 1);
        assert_eq!(store.read(&entry, 0, 9).await.unwrap(), b"abcd".as_ref());
    }

    #[tokio::test]
    async fn hollow_tail_backfills_at_the_chunk_boundary() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"abcd").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        store.truncate(&entry, 12).await.unwrap();

        // Content still grows into the hollow tail, one contiguous
        // chunk at a time.
        let entry = refreshed(&conn, "/data.bin").await;
        store.write(&entry, 4, b"wxyz").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        store.write(&entry, 8, b"zz").await.unwrap();

        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(entry.length(), 12);
        assert_eq!(conn.backend().count_chunks().await.unwrap(), 3);
        assert_eq!(
            store.read(&entry, 0, 12).await.unwrap(),
            b"abcdwxyzzz".as_ref()
        );
    }

    #[tokio::test]
    async fn short_tail_chunk_blocks_appends_past_it() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"aaaaab").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        store.truncate(&entry, 12).await.unwrap();

        // Chunk 1 holds two bytes; a fresh chunk 2 would strand them.
        let entry = refreshed(&conn, "/data.bin").await;
        let err = store.write(&entry, 8, b"ef").await.unwrap_err();
        assert!(matches!(err, FsError::InvalidOffset { offset: 8, length: 12 }));

        // Filling the tail first makes the same append valid.
        store.write(&entry, 6, b"cd").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        store.write(&entry, 8, b"ef").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(
            store.read(&entry, 0, 10).await.unwrap(),
            b"aaaaabcdef".as_ref()
        );
    }

    #[tokio::test]
    async fn within_chunk_holes_zero_fill() {
        let (conn, store, entry) = store_with_file(4).await;
        store.write(&entry, 0, b"ab").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        store.truncate(&entry, 4).await.unwrap();

        // The hole stays inside the existing tail chunk, so the splice
        // pads it with zeros instead of rejecting.
        let entry = refreshed(&conn, "/data.bin").await;
        store.write(&entry, 3, b"Z").await.unwrap();
        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(store.read(&entry, 0, 4).await.unwrap(), b"ab\0Z".as_ref());
        assert_eq!(conn.backend().count_chunks().await.unwrap(), 1);
    }

    /// Delegates to a `MemoryBackend`, noting every chunk window fetched.
    struct RecordingBackend {
        inner: MemoryBackend,
        windows: Mutex<Vec<(u64, u64)>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                windows: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn reconnect(&self) -> Result<(), BackendError> {
            self.inner.reconnect().await
        }

        async fn insert_entry(&self, doc: &Document) -> Result<(), BackendError> {
            self.inner.insert_entry(doc).await
        }

        async fn find_entry(&self, filename: &str) -> Result<Option<Document>, BackendError> {
            self.inner.find_entry(filename).await
        }

        async fn find_and_lock_entry(
            &self,
            filename: &str,
            lock_id: &str,
        ) -> Result<Option<Document>, BackendError> {
            self.inner.find_and_lock_entry(filename, lock_id).await
        }

        async fn clear_lock(&self, filename: &str) -> Result<(), BackendError> {
            self.inner.clear_lock(filename).await
        }

        async fn entries_in_directory(
            &self,
            directory: &str,
        ) -> Result<Vec<Document>, BackendError> {
            self.inner.entries_in_directory(directory).await
        }

        async fn count_children(&self, directory: &str) -> Result<u64, BackendError> {
            self.inner.count_children(directory).await
        }

        async fn delete_entry(&self, id: &ObjectId) -> Result<(), BackendError> {
            self.inner.delete_entry(id).await
        }

        async fn rename_entry(
            &self,
            id: &ObjectId,
            new_filename: &str,
        ) -> Result<(), BackendError> {
            self.inner.rename_entry(id, new_filename).await
        }

        async fn bump_link_count(&self, filename: &str, delta: i64) -> Result<(), BackendError> {
            self.inner.bump_link_count(filename, delta).await
        }

        async fn replace_entry_fields(
            &self,
            id: &ObjectId,
            metadata: &Document,
            attrs: &Document,
        ) -> Result<(), BackendError> {
            self.inner.replace_entry_fields(id, metadata, attrs).await
        }

        async fn set_entry_length(&self, id: &ObjectId, length: u64) -> Result<(), BackendError> {
            self.inner.set_entry_length(id, length).await
        }

        async fn chunks_in_range(
            &self,
            owner: &ObjectId,
            first: u64,
            last: u64,
        ) -> Result<Vec<ChunkRecord>, BackendError> {
            self.windows.lock().unwrap().push((first, last));
            self.inner.chunks_in_range(owner, first, last).await
        }

        async fn insert_chunk(
            &self,
            owner: &ObjectId,
            index: u64,
            data: &[u8],
        ) -> Result<(), BackendError> {
            self.inner.insert_chunk(owner, index, data).await
        }

        async fn replace_chunk_data(&self, id: &ObjectId, data: &[u8]) -> Result<(), BackendError> {
            self.inner.replace_chunk_data(id, data).await
        }

        async fn delete_chunks_from(&self, owner: &ObjectId, first: u64) -> Result<(), BackendError> {
            self.inner.delete_chunks_from(owner, first).await
        }

        async fn count_entries(&self) -> Result<u64, BackendError> {
            self.inner.count_entries().await
        }

        async fn count_chunks(&self) -> Result<u64, BackendError> {
            self.inner.count_chunks().await
        }

        async fn purge(&self) -> Result<(), BackendError> {
            self.inner.purge().await
        }
    }

    #[tokio::test]
    async fn write_fetches_only_the_spanned_chunks() {
        let recorder = Arc::new(RecordingBackend::new());
        let conn = Arc::new(Connection::new(
            recorder.clone(),
            Duration::from_secs(60),
            None,
        ));
        let store = ChunkStore::new(conn.clone());
        let entry = FsEntry::new_file("/data.bin", EntryMetadata::file(0o644, 0, 0))
            .with_chunk_size(4);
        conn.backend()
            .insert_entry(&entry.to_document().unwrap())
            .await
            .unwrap();
        store.write(&entry, 0, b"aaaabbbbccccdddd").await.unwrap();

        // A two-byte splice into chunk 1 of a four-chunk file must not
        // drag the rest of the file along.
        let entry = refreshed(&conn, "/data.bin").await;
        recorder.windows.lock().unwrap().clear();
        store.write(&entry, 5, b"XY").await.unwrap();
        assert_eq!(*recorder.windows.lock().unwrap(), vec![(0, 1)]);

        let entry = refreshed(&conn, "/data.bin").await;
        assert_eq!(store.read(&entry, 4, 3).await.unwrap(), b"bXYb".as_ref());
    }
}
