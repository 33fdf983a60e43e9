//! # fitlink-store
//!
//! Local storage for the FitLink coordination layer, backed by SQLite.
//!
//! The only domain data persisted here is the invitation-queue snapshot so
//! pending workout invitations survive an app restart.  Expiry instants are
//! stored as absolute timestamps, never countdowns.  The crate exposes a
//! synchronous `Database` handle wrapping a `rusqlite::Connection` with
//! typed CRUD helpers.

pub mod database;
pub mod invitations;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::StoreError;
