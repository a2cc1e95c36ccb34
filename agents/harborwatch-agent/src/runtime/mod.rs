//! Runtime module
//!
//! This module provides abstraction over different container runtimes
//! through a common RuntimeAdapter trait, the Docker implementation, and
//! the multiplexed log stream codec.

pub mod adapter;
pub mod docker;
pub mod mux;
