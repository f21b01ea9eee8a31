//! 后台维护 worker

pub mod cleanup_worker;

pub use cleanup_worker::CleanupWorker;
