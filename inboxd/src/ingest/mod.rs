pub mod backoff;
pub mod connectivity;
pub mod queue;
pub mod stability;
pub mod status;
pub mod store;
pub mod watcher;
pub mod worker;
