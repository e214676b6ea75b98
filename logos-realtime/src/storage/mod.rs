//! Persistence implementations for document content.
//!
//! ```text
//! ┌──────────────┐  load_latest_content  ┌──────────────────────────────────┐
//! │ReplicaManager│ ◄──────────────────── │ DocumentStore (RocksDB)          │
//! │              │ ────────────────────► │  CF "documents": LZ4 snapshots  │
//! └──────────────┘     save_content      │  CF "metadata" : bincode meta   │
//!                                        └──────────────────────────────────┘
//! ```
//!
//! [`MemoryStore`] keeps content in process memory. It backs the binary when
//! no storage path is configured and doubles as the test store.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};
