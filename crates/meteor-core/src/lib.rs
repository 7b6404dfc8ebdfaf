//! Core library for the Meteor network emulation engine.
//!
//! Decodes a binary scenario stream and a JSON node topology, programs
//! Linux TC state over rtnetlink to match the link quality each describes,
//! and keeps that state current either by replaying a scenario file
//! (`meteor`) or by driving a live TCP control plane (`meteord`). Both
//! front ends share the same [`Controller`] over the same rule table and TC
//! programmer; only the source of updates differs.
//!
//! # Example
//!
//! ```ignore
//! use meteor_core::controller::Controller;
//! use meteor_core::netlink::Connection;
//! use meteor_core::rules::RuleTable;
//! use meteor_core::tc::{Mode, TcProgrammer};
//!
//! let conn = Connection::new()?;
//! let tc = TcProgrammer::new(conn);
//! let table = RuleTable::new(ifb_ifindex, Mode::Ip, 1_000_000_000.0);
//! let mut controller = Controller::new(tc, table);
//! controller.apply(7, shape).await?;
//! ```

pub mod control;
pub mod controller;
pub mod error;
pub mod netlink;
pub mod player;
pub mod rules;
pub mod scenario;
pub mod scheduler;
pub mod signals;
pub mod tc;
pub mod topology;
pub mod util;

pub use controller::Controller;
pub use error::{MeteorError, Result};
