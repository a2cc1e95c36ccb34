//! Agent Core Modules

pub mod actions;
pub mod metrics;
pub mod state;
pub mod streams;
