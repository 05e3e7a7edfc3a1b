//! Quiz Forge — supervised quiz generation from markdown documents.

pub mod api;
pub mod config;
pub mod error;
pub mod generation;
pub mod store;
pub mod tasks;
