pub mod cli;
pub mod config;
pub mod core;
pub mod ipc;
pub mod plugin;
pub mod ui;
pub mod utils;
