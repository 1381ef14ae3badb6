pub mod app;
pub mod artifacts;
pub mod batch;
pub mod catalog;
pub mod civitai;
pub mod config;
pub mod env_flags;
pub mod filter;
pub mod fs_cache;
pub mod hashing;
pub mod liblib;
pub mod library;
pub mod model;
pub mod preview;
pub mod scrape;
pub mod store;
pub mod tasks;
