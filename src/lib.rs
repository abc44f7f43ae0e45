#![forbid(unsafe_code)]

//! acceptance_rig (arig): scripted hardware acceptance tests driven over two
//! serial links, MAIN (application console) and BOOT (bootloader console).
//!
//! Bytes from each link are reassembled into lines, buffered per channel, and
//! matched against an ordered instruction script. A per-test sequencer is
//! evaluated on a periodic tick; it records PASS/FAIL test points, watches
//! for early-termination conditions, and bounds the number of failed
//! attempts before a test is inhibited.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use acceptance_rig::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use acceptance_rig::script::Script;
//! use acceptance_rig::terminal::buffer::ChannelBuffer;
//! ```

pub mod prelude;

pub mod core;
pub mod logger;
pub mod matcher;
#[cfg(feature = "runner")]
pub mod runner;
pub mod script;
pub mod sequencer;
pub mod terminal;
pub mod transport;
