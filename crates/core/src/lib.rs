//! Core domain types and shared logic for the hoard cache server.
//!
//! This crate defines the vocabulary used by the other crates:
//! - Cache entry coordinates (`key`, `version`, `scope`)
//! - Upload identifiers
//! - Object naming inside a storage folder
//! - Configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod layout;
pub mod upload;

pub use cache::CacheTriple;
pub use error::{Error, Result};
pub use upload::UploadId;
