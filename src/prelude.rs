//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use acceptance_rig::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, RigError};

// Terminals
pub use crate::terminal::buffer::{ChannelBuffer, Line};
pub use crate::terminal::framer::LineReassembler;
pub use crate::terminal::ingest::{IngestHandle, spawn_ingest};
pub use crate::terminal::{ChannelId, TerminalPair};

// Scripts
pub use crate::script::{Script, TransferSpec};
pub use crate::script::instruction::{Instruction, SpecialCheck, TimingMark};
pub use crate::script::list::InstructionList;

// Sequencer
pub use crate::sequencer::outcome::{
    MemorySink, ResultSink, RunRecord, TestPointOutcome, Verdict,
};
pub use crate::sequencer::policy::{Failure, FailureKind, RunConclusion, RunStatus};
pub use crate::sequencer::run::{TestRun, TickOutcome};
pub use crate::sequencer::{RunSettings, TestProfile};

// Transport
pub use crate::transport::loopback::LoopbackTransport;
pub use crate::transport::{LinkSnapshot, Transport};

// Runner
#[cfg(feature = "runner")]
pub use crate::runner::loop_main::{RunReport, Runner, RunnerConfig};
