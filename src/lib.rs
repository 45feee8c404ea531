//! Keeps a local SQLite snapshot of a news feed, each entry enriched with
//! the `og:image` of its article page.
//!
//! - [`feed`] - feed download, parsing and image lookup
//! - [`storage`] - the snapshot table
//! - [`pipeline`] - one fetch-enrich-replace cycle
//! - [`scheduler`] - the single cycle worker and the recurring timer
//! - [`config`] - optional TOML configuration

pub mod config;
pub mod feed;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
