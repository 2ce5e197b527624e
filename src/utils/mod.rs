//! Utility functions and helpers.

pub mod env;

pub use env::{get_env_flag, get_env_with_prefix, parse_flag};
