//! Binary scenario file decoding.
//!
//! The wire format is little-endian and packed: a fixed header followed by
//! `time_record_count` groups of `(TimeRecord, LinkRecord...)`. This mirrors
//! the way [`crate::netlink::message`] decodes kernel structures with
//! `zerocopy` rather than hand-rolled byte shuffling.

mod error;
mod reader;

pub use error::ScenarioError;
pub use reader::{LinkRecord, ScenarioHeader, ScenarioReader, TimeRecord};
