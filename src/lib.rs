//! Media archive core: content-addressed ingestion and visual-similarity families.

pub mod config;
pub mod db;
pub mod family;
pub mod logging;
pub mod scanner;
