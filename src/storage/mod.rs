// Storage layer: log-structured persistence with snapshot-on-start restore

pub mod database;

pub use database::{Database, StorageError, StoredSignal};
