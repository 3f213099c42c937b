//! Storage backend implementations.
//!
//! Each backend is gated behind a feature flag.
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | SQLite | `sqlite` | Embedded database for development and small deployments |

#[cfg(feature = "sqlite")]
pub mod sqlite;
