//! Vector storage and nearest-neighbor queries
//!
//! Chunk vectors live in their own SQLite file, one table per collection.
//! The store is derivable state: losing it is recoverable by re-embedding
//! from the durable store.

mod store;

pub use store::{VectorStore, LIVE_COLLECTION, TEMP_COLLECTION};
