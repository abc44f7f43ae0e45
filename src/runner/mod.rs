//! Unattended execution: the tick loop and the operator signals that steer it.

pub mod loop_main;
pub mod signals;
