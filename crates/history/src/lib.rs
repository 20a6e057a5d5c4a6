//! Local history of observed entity states.
//!
//! Every entity keeps an append-only sequence of [`HistoryPoint`]s bounded
//! to the latest [`HISTORY_CAPACITY`] entries. The same key-value store
//! also holds the single [`Settings`] record.

mod buffer;
pub mod error;
pub mod history;
pub mod kv;
pub mod settings;

pub use error::{StorageError, StorageResult};
pub use history::{ENTITY_KEY_PREFIX, HISTORY_CAPACITY, HistoryPoint, HistoryStore};
pub use kv::{FileStore, KvStore, MemoryStore};
pub use settings::{SETTINGS_KEY, Settings};
