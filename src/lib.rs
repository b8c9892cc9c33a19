//! Storage engine for a MongoDB-backed mountable filesystem.
//!
//! File and directory metadata live as discriminated documents in one
//! collection, file content as fixed-size binary chunks in another. The
//! engine translates POSIX-style operations into document and chunk
//! operations and keeps the mount usable across transient backend
//! outages; the kernel-facing bridge is an external consumer of this
//! crate.

pub mod backend;
pub mod config;
pub mod fs;
