pub mod backup_runner;
pub mod chain;
pub mod encryption;
pub mod event_log;
pub mod mongo_tools;
pub mod oplog;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod transport;
