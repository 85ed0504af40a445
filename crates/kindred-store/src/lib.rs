//! # kindred-store
//!
//! SQLite persistence for Kindred.
//!
//! Locally this crate stands in for the managed relational backend: it holds
//! the `users`, `messages`, `swipes` and `matches` tables plus a small
//! key-value table for client-local durable state (the message retry queue).
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model, including the two atomic procedures the core relies on:
//! create-match-if-not-exists and the guarded daily swipe decrement.

pub mod database;
pub mod kv;
pub mod matches;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod swipes;
pub mod users;

mod convert;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
