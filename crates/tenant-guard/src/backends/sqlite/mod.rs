//! SQLite backend implementation.
//!
//! One [`SqliteBackend`] implements every storage trait of the guard. It
//! supports in-memory databases (for tests) and file-based databases.
//!
//! # Example
//!
//! ```no_run
//! use helios_tenant_guard::backends::sqlite::SqliteBackend;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqliteBackend::open("./data/guard.db")?;
//! backend.init_schema()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE records (
//!     table_name TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     tenant_id TEXT NOT NULL,
//!     data TEXT NOT NULL,       -- JSON
//!     version INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     PRIMARY KEY (table_name, id)
//! );
//!
//! -- Entries waiting for delivery
//! CREATE TABLE audit_outbox (
//!     outbox_id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     entry_id TEXT NOT NULL UNIQUE,
//!     payload TEXT NOT NULL,
//!     enqueued_at TEXT NOT NULL
//! );
//!
//! -- Append-only; UPDATE and DELETE abort
//! CREATE TABLE audit_log (
//!     sequence INTEGER PRIMARY KEY AUTOINCREMENT,
//!     id TEXT NOT NULL UNIQUE,
//!     ...
//! );
//! ```
//!
//! Tenants, memberships and user profiles live in `tenants`,
//! `tenant_memberships` and `user_profiles`.

mod audit;
mod backend;
mod membership;
mod records;
mod schema;
mod transaction;

pub use backend::{SqliteBackend, SqliteBackendConfig};
pub use transaction::SqliteRecordTransaction;
