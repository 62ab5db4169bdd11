//! Weft - hybrid retrieval over a living corpus of notes
//!
//! Combines semantic vector search, keyword search and a link graph into
//! one ranked result list, keeps the index in sync with documents that
//! change underneath it, and packs results into a bounded context block.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod hydrate;
pub mod index;
pub mod retrieval;
pub mod source;
pub mod storage;
pub mod sync;
pub mod worker;

pub use error::{Result, WeftError};
