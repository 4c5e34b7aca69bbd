pub mod backup;
pub mod log_entry;
pub mod settings;
