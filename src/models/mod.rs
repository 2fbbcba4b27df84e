//! Core data models for the image intake service.
//!
//! Storage rows (`Bucket`, `Object`) map to SQLite tables via `sqlx::FromRow`;
//! events, verdicts and thumbnail specs are plain values passed between the
//! pipeline components.

pub mod bucket;
pub mod document;
pub mod event;
pub mod object;
pub mod thumbnail;
pub mod verdict;
