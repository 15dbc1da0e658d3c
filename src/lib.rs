pub mod config;
pub mod instance;
pub mod ipc;
pub mod process_monitor;
pub mod supervisor;
pub mod utils;
