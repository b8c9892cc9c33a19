pub mod chunk;
pub mod entry;

pub use chunk::ChunkStore;
pub use entry::{EntryStore, LockMode};
