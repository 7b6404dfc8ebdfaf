//! The TC Programmer: turns link-quality values into qdisc/class/filter
//! state on an interface.
//!
//! Built directly on `crate::netlink`'s connection and message-builder
//! plumbing rather than reinventing it, adding only the TC-specific message
//! construction ([`program`]), IFB lifecycle ([`link`]) and unit
//! conversions ([`units`]) this daemon needs.

pub mod error;
pub mod link;
pub mod program;
pub mod units;

pub use error::{Result, TcError};
pub use program::{LinkShape, Mode, TcProgrammer};
