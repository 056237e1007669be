pub mod agent;
pub mod api;
pub mod config;
pub mod database;
pub mod discovery;
pub mod error;
pub mod git;
pub mod instructions;
pub mod logs;
pub mod orchestrator;
pub mod process;
pub mod server;
pub mod sessions;
pub mod staging;
pub mod validation;
