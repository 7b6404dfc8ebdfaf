//! Shared utilities for meteor-core.

pub mod addr;

pub use addr::{parse_addr, parse_prefix};
