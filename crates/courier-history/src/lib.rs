pub mod error;
pub mod history;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use history::{load_history, persist_history, trim_history, HistoryEntry, Role};
pub use sqlite::SqliteStore;
pub use store::{KvStore, MemoryStore};
