use std::time::{SystemTime, UNIX_EPOCH};

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::DEFAULT_CHUNK_SIZE;
use super::errors::FsError;

const FILE_TYPE: &str = "file";
const DIRECTORY_TYPE: &str = "directory";
const SYMLINK_TYPE: &str = "symbolic_link";

/// POSIX-like stat block embedded in every entry document. Saved
/// wholesale; the backend never merges individual fields (except for the
/// atomic link-count and size updates the stores issue themselves).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default)]
    pub st_mode: u32,
    #[serde(default)]
    pub st_nlink: u32,
    #[serde(default)]
    pub st_size: u64,
    #[serde(default)]
    pub st_uid: u32,
    #[serde(default)]
    pub st_gid: u32,
    #[serde(default)]
    pub st_atime: i64,
    #[serde(default)]
    pub st_mtime: i64,
    #[serde(default)]
    pub st_ctime: i64,
}

impl EntryMetadata {
    pub fn file(mode: u32, uid: u32, gid: u32) -> Self {
        Self::stamped(0o100000 | mode, 1, uid, gid)
    }

    pub fn directory(mode: u32, uid: u32, gid: u32) -> Self {
        // nlink 2: . and ..
        Self::stamped(0o040000 | mode, 2, uid, gid)
    }

    pub fn symlink(uid: u32, gid: u32) -> Self {
        Self::stamped(0o120000 | 0o777, 1, uid, gid)
    }

    fn stamped(st_mode: u32, st_nlink: u32, st_uid: u32, st_gid: u32) -> Self {
        let now = now_secs();
        Self {
            st_mode,
            st_nlink,
            st_size: 0,
            st_uid,
            st_gid,
            st_atime: now,
            st_mtime: now,
            st_ctime: now,
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// What kind of entry a document represents. The discriminant on the
/// wire is a string; anything unrecognized decodes to `Unknown` so a
/// listing containing a record written by a newer version still works.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    File { length: u64, chunk_size: u64 },
    Directory,
    Symlink { target: Option<String> },
    Unknown { discriminant: String },
}

impl EntryKind {
    fn discriminant(&self) -> &str {
        match self {
            EntryKind::File { .. } => FILE_TYPE,
            EntryKind::Directory => DIRECTORY_TYPE,
            EntryKind::Symlink { .. } => SYMLINK_TYPE,
            EntryKind::Unknown { discriminant } => discriminant,
        }
    }
}

/// One filesystem entry: a file, directory or symlink document.
#[derive(Debug, Clone)]
pub struct FsEntry {
    pub id: ObjectId,
    pub filename: String,
    pub directory: String,
    pub kind: EntryKind,
    pub metadata: EntryMetadata,
    pub attrs: Document,
    pub lock: Option<String>,
}

impl FsEntry {
    pub fn new_file(filename: &str, metadata: EntryMetadata) -> Self {
        Self::new(
            filename,
            EntryKind::File {
                length: 0,
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
            metadata,
        )
    }

    pub fn new_directory(filename: &str, metadata: EntryMetadata) -> Self {
        Self::new(filename, EntryKind::Directory, metadata)
    }

    pub fn new_symlink(filename: &str, target: &str, metadata: EntryMetadata) -> Self {
        Self::new(
            filename,
            EntryKind::Symlink {
                target: Some(target.to_string()),
            },
            metadata,
        )
    }

    fn new(filename: &str, kind: EntryKind, metadata: EntryMetadata) -> Self {
        Self {
            id: ObjectId::new(),
            filename: filename.to_string(),
            directory: parent_directory(filename),
            kind,
            metadata,
            attrs: Document::new(),
            lock: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        if let EntryKind::File { chunk_size: cs, .. } = &mut self.kind {
            *cs = chunk_size.max(1);
        }
        self
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// Recorded content length; zero for anything that is not a file.
    pub fn length(&self) -> u64 {
        match self.kind {
            EntryKind::File { length, .. } => length,
            _ => 0,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        match self.kind {
            EntryKind::File { chunk_size, .. } => chunk_size.max(1),
            _ => DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn decode(doc: &Document) -> Result<FsEntry, FsError> {
        let id = doc
            .get_object_id("_id")
            .map_err(|_| FsError::InvalidData("entry document has no _id".to_string()))?;
        let filename = doc
            .get_str("filename")
            .map_err(|_| FsError::InvalidData(format!("entry {id} has no filename")))?
            .to_string();
        let directory = doc.get_str("directory").unwrap_or_default().to_string();
        let metadata = match doc.get_document("metadata") {
            Ok(raw) => bson::from_document(raw.clone()).unwrap_or_else(|e| {
                warn!("FsEntry::decode({}): unreadable metadata: {}", filename, e);
                EntryMetadata::default()
            }),
            Err(_) => EntryMetadata::default(),
        };
        let attrs = doc.get_document("attrs").cloned().unwrap_or_default();
        let lock = doc.get_str("lock").ok().map(str::to_string);
        let kind = match doc.get_str("generic_file_type") {
            Ok(FILE_TYPE) => EntryKind::File {
                length: int_field(doc, "length").unwrap_or(0).max(0) as u64,
                chunk_size: int_field(doc, "chunkSize")
                    .filter(|cs| *cs > 0)
                    .unwrap_or(DEFAULT_CHUNK_SIZE as i64) as u64,
            },
            Ok(DIRECTORY_TYPE) => EntryKind::Directory,
            Ok(SYMLINK_TYPE) => EntryKind::Symlink {
                target: doc.get_str("target").ok().map(str::to_string),
            },
            Ok(other) => {
                warn!(
                    "FsEntry::decode({}): unknown discriminant {:?}, keeping the base record",
                    filename, other
                );
                EntryKind::Unknown {
                    discriminant: other.to_string(),
                }
            }
            Err(_) => {
                warn!(
                    "FsEntry::decode({}): missing discriminant, keeping the base record",
                    filename
                );
                EntryKind::Unknown {
                    discriminant: String::new(),
                }
            }
        };
        Ok(FsEntry {
            id,
            filename,
            directory,
            kind,
            metadata,
            attrs,
            lock,
        })
    }

    pub fn to_document(&self) -> Result<Document, FsError> {
        let metadata = bson::to_document(&self.metadata)
            .map_err(|e| FsError::InvalidData(format!("unencodable metadata: {e}")))?;
        let mut doc = doc! {
            "_id": self.id,
            "filename": &self.filename,
            "generic_file_type": self.kind.discriminant(),
            "directory": &self.directory,
            "metadata": metadata,
            "attrs": self.attrs.clone(),
        };
        if let EntryKind::File { length, chunk_size } = self.kind {
            doc.insert("length", length as i64);
            doc.insert("chunkSize", chunk_size as i64);
        }
        if let EntryKind::Symlink {
            target: Some(target),
        } = &self.kind
        {
            doc.insert("target", target);
        }
        if let Some(lock) = &self.lock {
            doc.insert("lock", lock);
        }
        Ok(doc)
    }
}

/// Parent path of an absolute filename; the root's parent is the empty
/// sentinel.
pub fn parent_directory(filename: &str) -> String {
    if filename == "/" {
        return String::new();
    }
    match filename.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => filename[..idx].to_string(),
    }
}

fn int_field(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key) {
        Some(Bson::Int32(v)) => Some(*v as i64),
        Some(Bson::Int64(v)) => Some(*v),
        Some(Bson::Double(v)) => Some(*v as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_entry_round_trips_through_a_document() {
        let entry = FsEntry::new_file("/docs/report.txt", EntryMetadata::file(0o644, 1000, 1000))
            .with_chunk_size(8);
        let doc = entry.to_document().unwrap();
        let decoded = FsEntry::decode(&doc).unwrap();

        assert_eq!(decoded.id, entry.id);
        assert_eq!(decoded.filename, "/docs/report.txt");
        assert_eq!(decoded.directory, "/docs");
        assert_eq!(
            decoded.kind,
            EntryKind::File {
                length: 0,
                chunk_size: 8
            }
        );
        assert_eq!(decoded.metadata, entry.metadata);
        assert!(decoded.lock.is_none());
    }

    #[test]
    fn symlink_keeps_its_target() {
        let entry = FsEntry::new_symlink("/here", "/there", EntryMetadata::symlink(0, 0));
        let decoded = FsEntry::decode(&entry.to_document().unwrap()).unwrap();

        assert_eq!(
            decoded.kind,
            EntryKind::Symlink {
                target: Some("/there".to_string())
            }
        );
    }

    #[test]
    fn unknown_discriminant_degrades_to_the_base_record() {
        let doc = doc! {
            "_id": ObjectId::new(),
            "filename": "/strange",
            "generic_file_type": "hard_link",
            "directory": "/",
            "metadata": { "st_mode": 0o100644, "st_nlink": 1 },
        };
        let decoded = FsEntry::decode(&doc).unwrap();

        assert_eq!(
            decoded.kind,
            EntryKind::Unknown {
                discriminant: "hard_link".to_string()
            }
        );
        assert_eq!(decoded.filename, "/strange");
        assert_eq!(decoded.metadata.st_nlink, 1);
        // Re-encoding keeps the unrecognized discriminant as-is.
        let doc = decoded.to_document().unwrap();
        assert_eq!(doc.get_str("generic_file_type").ok(), Some("hard_link"));
    }

    #[test]
    fn missing_discriminant_degrades_too() {
        let doc = doc! { "_id": ObjectId::new(), "filename": "/bare" };
        let decoded = FsEntry::decode(&doc).unwrap();

        assert!(matches!(decoded.kind, EntryKind::Unknown { .. }));
        assert_eq!(decoded.metadata, EntryMetadata::default());
    }

    #[test]
    fn documents_without_identity_are_rejected() {
        let no_id = doc! { "filename": "/f", "generic_file_type": "file" };
        assert!(matches!(
            FsEntry::decode(&no_id),
            Err(FsError::InvalidData(_))
        ));

        let no_name = doc! { "_id": ObjectId::new(), "generic_file_type": "file" };
        assert!(matches!(
            FsEntry::decode(&no_name),
            Err(FsError::InvalidData(_))
        ));
    }

    #[test]
    fn zero_chunk_size_falls_back_to_the_default() {
        let doc = doc! {
            "_id": ObjectId::new(),
            "filename": "/f",
            "generic_file_type": "file",
            "length": 3_i64,
            "chunkSize": 0_i64,
        };
        let decoded = FsEntry::decode(&doc).unwrap();

        assert_eq!(decoded.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(decoded.length(), 3);
    }

    #[test]
    fn parent_directories_of_paths() {
        assert_eq!(parent_directory("/"), "");
        assert_eq!(parent_directory("/a"), "/");
        assert_eq!(parent_directory("/a/b"), "/a");
        assert_eq!(parent_directory("/a/b/c"), "/a/b");
    }
}
