// Pool Drivers (SQLite, PostgreSQL, Memory)
// Contains the pool implementation for each supported backend type

pub mod memory;
pub mod postgres;
pub mod sqlite;

// Re-export drivers
pub use memory::{MemoryDriver, MemoryPool};
pub use postgres::{PostgresDriver, PostgresPool};
pub use sqlite::{SqliteDriver, SqliteManager, SqlitePool};
