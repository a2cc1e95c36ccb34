//! CLI Support Modules

pub mod config;
