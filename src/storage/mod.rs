// Persistence for analyses, the archive and the last known price per symbol.

pub mod sqlite;

pub use sqlite::{ActiveFilter, SqliteStorage};
