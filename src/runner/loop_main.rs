//! Tick loop that drives one [`TestRun`] through its attempts.
//!
//! The loop owns nothing but timing: every decision about steps and failures
//! is made by the sequencer. Per tick the loop evaluates once, advances past a
//! completed step (after operator confirmation where the step asks for it),
//! and concludes the attempt when it fails, finishes, or is aborted.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::runner::signals::SignalHandler;
use crate::script::instruction::Instruction;
use crate::sequencer::policy::{Failure, RunConclusion, RunStatus};
use crate::sequencer::run::{RunSnapshot, TestRun, TickOutcome};

// ──────────────────── operator ────────────────────

/// Answers confirmation prompts for steps that require an acknowledgement.
pub trait Operator: Send {
    /// Return `true` to confirm. A `false` answer is asked again next tick.
    fn confirm(&mut self, test_name: &str, step: &Instruction) -> bool;
}

/// Confirms every prompt; for unattended stations and replays.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl Operator for AutoConfirm {
    fn confirm(&mut self, _test_name: &str, _step: &Instruction) -> bool {
        true
    }
}

// ──────────────────── configuration ────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub tick_interval: Duration,
    /// Start the next attempt automatically while attempts remain.
    pub auto_retry: bool,
    /// Wall-clock bound per attempt; exceeding it aborts the attempt.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            auto_retry: false,
            attempt_timeout: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.engine.tick_interval_ms),
            ..Self::default()
        }
    }
}

// ──────────────────── report ────────────────────

/// Summary of everything [`Runner::run`] did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub test_name: String,
    pub conclusion: RunConclusion,
    pub attempts_started: u32,
    pub failures: Vec<Failure>,
    pub aborted: bool,
    pub timed_out: bool,
    pub elapsed_ms: u64,
    pub ticks: u64,
    pub snapshot: RunSnapshot,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        matches!(self.conclusion, RunConclusion::Passed { .. })
    }
}

enum AttemptEnd {
    Concluded(RunConclusion),
    Aborted,
    TimedOut,
}

// ──────────────────── runner ────────────────────

type AttemptHook = Box<dyn FnMut(u32) + Send>;

pub struct Runner {
    run: Arc<TestRun>,
    config: RunnerConfig,
    signals: SignalHandler,
    operator: Box<dyn Operator>,
    on_attempt: Option<AttemptHook>,
    last_failure: Option<Failure>,
    ticks: u64,
}

impl Runner {
    pub fn new(run: Arc<TestRun>, config: RunnerConfig) -> Self {
        Self {
            run,
            config,
            signals: SignalHandler::detached(),
            operator: Box::new(AutoConfirm),
            on_attempt: None,
            last_failure: None,
            ticks: 0,
        }
    }

    #[must_use]
    pub fn with_signals(mut self, signals: SignalHandler) -> Self {
        self.signals = signals;
        self
    }

    #[must_use]
    pub fn with_operator(mut self, operator: Box<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    /// Called with the attempt number right after each attempt starts, before
    /// the first tick.
    #[must_use]
    pub fn on_attempt_started(mut self, hook: impl FnMut(u32) + Send + 'static) -> Self {
        self.on_attempt = Some(Box::new(hook));
        self
    }

    pub fn test_run(&self) -> &Arc<TestRun> {
        &self.run
    }

    /// Drive attempts until one passes, the bound is reached, auto-retry is
    /// off, or the operator aborts. Fails only when the test is inhibited or
    /// cannot start.
    pub fn run(&mut self) -> Result<RunReport> {
        let started_at = Instant::now();
        let mut failures = Vec::new();
        let mut attempts_started = 0;
        let mut aborted = false;
        let mut timed_out = false;

        let conclusion = loop {
            let attempt = self.run.start()?;
            attempts_started += 1;
            if let Some(hook) = self.on_attempt.as_mut() {
                hook(attempt);
            }

            match self.drive_attempt() {
                AttemptEnd::Concluded(conclusion) => {
                    if let Some(failure) = self.last_failure.take() {
                        failures.push(failure);
                    }
                    match conclusion {
                        RunConclusion::Retry { remaining, .. } if self.config.auto_retry => {
                            eprintln!(
                                "[ARIG-RUNNER] {} attempt {attempt} failed, {remaining} left",
                                self.run.name()
                            );
                        }
                        other => break other,
                    }
                }
                AttemptEnd::Aborted => {
                    aborted = true;
                    break self.run.conclude();
                }
                AttemptEnd::TimedOut => {
                    timed_out = true;
                    break self.run.conclude();
                }
            }
        };

        Ok(RunReport {
            test_name: self.run.name().to_string(),
            conclusion,
            attempts_started,
            failures,
            aborted,
            timed_out,
            elapsed_ms: u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            ticks: self.ticks,
            snapshot: self.run.snapshot(),
        })
    }

    fn drive_attempt(&mut self) -> AttemptEnd {
        let deadline = self.config.attempt_timeout.map(|t| Instant::now() + t);
        loop {
            if self.signals.should_abort() {
                self.run.abort();
                return AttemptEnd::Aborted;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                eprintln!("[ARIG-RUNNER] {} attempt timed out", self.run.name());
                self.run.abort();
                return AttemptEnd::TimedOut;
            }
            if self.signals.should_restart() {
                if let Err(e) = self.run.request_restart() {
                    eprintln!("[ARIG-RUNNER] restart ignored: {e}");
                }
            }

            self.ticks += 1;
            match self.run.evaluate() {
                TickOutcome::Completed { .. } => {
                    self.leave_step();
                    continue;
                }
                TickOutcome::Failed(failure) => {
                    self.last_failure = Some(failure);
                    return AttemptEnd::Concluded(self.run.conclude());
                }
                TickOutcome::Finished => return AttemptEnd::Concluded(self.run.conclude()),
                TickOutcome::Idle => {
                    // Failed outside a tick, e.g. an operator restart.
                    if matches!(
                        self.run.status(),
                        RunStatus::Failed | RunStatus::Restarting
                    ) {
                        self.last_failure = self.run.failure();
                        return AttemptEnd::Concluded(self.run.conclude());
                    }
                }
                TickOutcome::Skipped | TickOutcome::Waiting => {}
            }
            thread::sleep(self.config.tick_interval);
        }
    }

    fn leave_step(&mut self) {
        let step = self.run.current_instruction();
        if step.user_ack_required && !step.state.acknowledged {
            if self.operator.confirm(self.run.name(), &step) {
                self.run.acknowledge();
            } else {
                thread::sleep(self.config.tick_interval);
            }
            return;
        }
        self.run.advance();
    }
}
