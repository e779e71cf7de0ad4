#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Shared state store with logical expiry, agent memories, and knowledge
//! retrieval.

/// Typed memory entries.
pub mod entry;
/// Durable file-backed store.
pub mod long_term;
/// Memory retrieval for decision reflection.
pub mod retriever;
/// In-process store.
pub mod short_term;
/// Storage contract and helpers.
pub mod store;

#[path = "../main.rs"]
pub mod orchestration_entry;

pub use entry::{MemoryCategory, MemoryEntry};
pub use long_term::FileStateStore;
pub use orchestration_entry::{MemoryService, MEMORY_PREFIX};
pub use retriever::{KeywordRetriever, KnowledgeRetriever, RankedMemory};
pub use short_term::MemoryStateStore;
pub use store::{expiry_after, get_json, put_json, StateStore, StoreError};
