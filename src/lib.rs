pub mod agent;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod mqtt;
