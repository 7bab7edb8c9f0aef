pub mod config;
pub mod credentials;
pub mod daemon;
pub mod ingest;
