pub mod api;
pub mod command;
pub mod config;
pub mod services;
