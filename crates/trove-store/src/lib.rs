//! Trove Store - the persisted index
//!
//! Files and assets live in a single sled database. Each library's
//! files are keyed by path, with secondary entries for content hashes
//! and asset ownership so handlers can find duplicates cheaply.
//!
//! All writes go through [`IndexTxn`], which stages changes and
//! applies them as one atomic batch.

mod store;
mod txn;
mod view;

pub use store::{IndexStore, StoreError};
pub use txn::{CommitStats, IndexTxn};
pub use view::IndexView;
