//! Image intake service: storage-triggered moderation and thumbnailing, and
//! a move counter driven by document creation.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod triggers;
