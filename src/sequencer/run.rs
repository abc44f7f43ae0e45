//! One test run: per-tick evaluation, operator operations, attempt policy.
//!
//! `evaluate` takes the run lock with `try_lock`; a tick that finds it held
//! returns [`TickOutcome::Skipped`] and changes nothing. Operator operations
//! take the lock normally. Timed waits inside a tick poll the abort flag so an
//! abort never waits for a whole power-on timeout.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::errors::{Result, RigError};
use crate::matcher;
use crate::script::TransferSpec;
use crate::script::instruction::{Instruction, SpecialCheck, TimingMark};
use crate::script::list::InstructionList;
use crate::sequencer::checks::{SpecialCheckHandler, SpecialOutcome, TerminationCondition};
use crate::sequencer::outcome::{ResultSink, RunRecord, TestPointOutcome, Verdict};
use crate::sequencer::policy::{
    AttemptPolicy, Failure, FailureKind, RunConclusion, RunStatus,
};
use crate::sequencer::transfer::{TransferProgress, TransferStep};
use crate::sequencer::{RunSettings, TestProfile};
use crate::terminal::{ChannelId, TerminalPair};
use crate::transport::Transport;

/// Diagnostic left on a step whose channel stayed silent.
pub const POWER_NOT_ON: &str = "POWER NOT ON";

const WAIT_SLICE: Duration = Duration::from_millis(20);

/// What one `evaluate` call observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tick", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Another evaluation held the lock; nothing ran.
    Skipped,
    /// The run is not in progress.
    Idle,
    Waiting,
    /// The current step is complete and may be advanced past.
    Completed { index: usize },
    /// Reported once, on the tick that latched the failure.
    Failed(Failure),
    /// Every step is complete.
    Finished,
}

enum Step {
    Pending,
    Done(Option<String>),
    Failed(Failure),
}

enum LinkGate {
    Up,
    Waiting,
    Failed(Failure),
}

struct RunState {
    status: RunStatus,
    list: InstructionList,
    policy: AttemptPolicy,
    /// Values every attempt starts from.
    base_vars: BTreeMap<String, String>,
    /// `base_vars` plus whatever this attempt captured.
    vars: BTreeMap<String, String>,
    failure: Option<Failure>,
    timer_start: Option<Instant>,
    /// Present while the attempt's USB transfer has not finished.
    transfer: Option<TransferProgress>,
    concluded: bool,
}

/// Point-in-time view for operator displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSnapshot {
    pub test_name: String,
    pub status: RunStatus,
    pub cursor: usize,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub attempts: u32,
    pub inhibited: bool,
    pub current_text: String,
    pub error_text: Option<String>,
}

pub struct TestRun {
    name: String,
    state: Mutex<RunState>,
    terminals: Arc<TerminalPair>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ResultSink>,
    special: Arc<dyn SpecialCheckHandler>,
    terminations: Vec<Box<dyn TerminationCondition>>,
    transfer: Option<TransferSpec>,
    settings: RunSettings,
    abort_requested: AtomicBool,
}

impl TestRun {
    pub fn new(
        profile: TestProfile,
        terminals: Arc<TerminalPair>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let TestProfile {
            name,
            instructions,
            vars,
            special,
            terminations,
            transfer,
            settings,
        } = profile;
        Self {
            name,
            state: Mutex::new(RunState {
                status: RunStatus::NotStarted,
                list: instructions,
                policy: AttemptPolicy::new(settings.max_attempts),
                vars: vars.clone(),
                base_vars: vars,
                failure: None,
                timer_start: None,
                transfer: None,
                concluded: false,
            }),
            terminals,
            transport,
            sink,
            special,
            terminations,
            transfer,
            settings,
            abort_requested: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn terminals(&self) -> &Arc<TerminalPair> {
        &self.terminals
    }

    // ──────────────────── tick ────────────────────

    /// Evaluate the current step once. Never blocks on the run lock.
    pub fn evaluate(&self) -> TickOutcome {
        let Some(mut guard) = self.state.try_lock() else {
            return TickOutcome::Skipped;
        };
        let state = &mut *guard;
        match state.status {
            RunStatus::InProgress => {}
            RunStatus::Completed => return TickOutcome::Finished,
            _ => return TickOutcome::Idle,
        }
        if self.is_abort_requested() {
            return TickOutcome::Idle;
        }
        if let Some(outcome) = self.poll_transfer(state) {
            return outcome;
        }

        let index = state.list.cursor();
        let progress = if state.list.current().is_complete() {
            Step::Done(None)
        } else {
            self.evaluate_step(state)
        };
        if self.is_abort_requested() {
            return TickOutcome::Idle;
        }

        let done = match progress {
            Step::Failed(failure) => return self.fail(state, failure),
            Step::Done(actual) => {
                if !state.list.current().is_complete() {
                    self.complete(state, actual);
                }
                true
            }
            Step::Pending => false,
        };

        if let Some(hit) = self.terminations.iter().find_map(|t| t.check(&self.terminals)) {
            let expected = expected_text(state.list.current(), &state.vars);
            let failure = Failure::new(hit.kind, index, &expected, &hit.evidence);
            return self.fail(state, failure);
        }

        if !done {
            return TickOutcome::Waiting;
        }
        let current = state.list.current();
        let awaiting_ack = current.user_ack_required && !current.state.acknowledged;
        if state.list.is_last() && !awaiting_ack {
            state.status = RunStatus::Completed;
            eprintln!(
                "[ARIG-RUN] {} attempt {} finished all {} steps",
                self.name,
                state.policy.current_attempt(),
                state.list.len()
            );
            return TickOutcome::Finished;
        }
        TickOutcome::Completed { index }
    }

    /// Drive the USB transfer; `None` once it has finished.
    fn poll_transfer(&self, state: &mut RunState) -> Option<TickOutcome> {
        let spec = self.transfer.as_ref()?;
        let progress = state.transfer.as_mut()?;
        match progress.poll(spec, &self.terminals, self.transport.as_ref(), Instant::now()) {
            TransferStep::Waiting => Some(TickOutcome::Waiting),
            TransferStep::Done { sends } => {
                state.transfer = None;
                self.sink.note(
                    &self.name,
                    &format!("test image transferred ('{}' sent {sends}x)", spec.command),
                );
                None
            }
            TransferStep::BannerTimeout => {
                state.transfer = None;
                let index = state.list.cursor();
                let failure = Failure::new(FailureKind::UsbTransfer, index, &spec.banner, "");
                let outcome = self.fail(state, failure);
                state.status = RunStatus::Restarting;
                self.terminals.set_capture(false);
                Some(outcome)
            }
        }
    }

    fn evaluate_step(&self, state: &mut RunState) -> Step {
        let index = state.list.cursor();
        let step = state.list.current_mut();
        if !step.check_required {
            return Step::Done(None);
        }

        if step.sample_delay_ms > 0 && !step.state.delay_elapsed {
            if !self.pause(Duration::from_millis(step.sample_delay_ms)) {
                return Step::Pending;
            }
            step.state.delay_elapsed = true;
        }

        if step.await_activity && !step.state.activity_seen {
            let Some(channel) = step.terminal else {
                return Step::Pending;
            };
            if self.await_activity(channel) {
                step.state.activity_seen = true;
                step.state.error_text = None;
            } else {
                if step.state.error_text.as_deref() != Some(POWER_NOT_ON) {
                    self.sink
                        .note(&self.name, &format!("{channel} silent: {POWER_NOT_ON}"));
                }
                step.state.error_text = Some(POWER_NOT_ON.to_string());
                return Step::Pending;
            }
        }

        if step.gates_on_link() {
            match self.check_links(step, index) {
                LinkGate::Up => {}
                LinkGate::Waiting => return Step::Pending,
                LinkGate::Failed(failure) => return Step::Failed(failure),
            }
        }

        let Some(pattern) = step.resolved_desired(&state.vars) else {
            return Step::Done(None);
        };
        let Some(channel) = step.terminal else {
            return Step::Done(None);
        };
        let buffer = self.terminals.buffer(channel);

        if step.has_special_check() {
            match self.special.evaluate(step, &pattern, buffer) {
                SpecialOutcome::Pending => {}
                SpecialOutcome::Passed { actual, capture } => {
                    if let Some((name, value)) = capture {
                        state.vars.insert(name, value);
                    }
                    if step.suppress_on_match {
                        if matches!(step.special, Some(SpecialCheck::ByteCount { .. })) {
                            buffer.suppress_all(&pattern);
                        } else {
                            buffer.suppress_first(&pattern);
                        }
                    }
                    return Step::Done(Some(actual));
                }
                SpecialOutcome::Failed { kind, actual } => {
                    return Step::Failed(Failure::new(kind, index, &pattern, &actual));
                }
            }
        } else if let Some(line) = buffer.first_match(&pattern) {
            if step.suppress_on_match {
                line.suppress();
            }
            return Step::Done(Some(line.text().to_string()));
        }

        if let Some(token) =
            matcher::forbidden_seen(buffer, &step.forbidden, step.forbidden_grace_lines)
        {
            return Step::Failed(Failure::new(FailureKind::WrongSource, index, &pattern, token));
        }

        self.note_miss(step, &pattern, channel);
        Step::Pending
    }

    fn check_links(&self, step: &mut Instruction, index: usize) -> LinkGate {
        let gated: Vec<ChannelId> = step.gated_channels().collect();
        for channel in gated {
            let link = self.transport.links().get(channel);
            if link.connected {
                continue;
            }
            if !link.seen_before {
                return LinkGate::Waiting;
            }
            match self.transport.reconnect(channel) {
                Ok(true) => {
                    step.state.reconnect_failures = 0;
                    self.sink.link_changed(channel, true);
                    eprintln!("[ARIG-RUN] {channel} link re-established");
                    if !self.transport.links().get(channel).connected {
                        return LinkGate::Waiting;
                    }
                }
                outcome => {
                    if let Err(e) = outcome {
                        eprintln!("[ARIG-RUN] {channel} reconnect error: {e}");
                    }
                    step.state.reconnect_failures += 1;
                    if step.state.reconnect_failures >= self.settings.reconnect_attempts {
                        return LinkGate::Failed(Failure::new(
                            FailureKind::LinkDown { channel },
                            index,
                            "",
                            "",
                        ));
                    }
                    return LinkGate::Waiting;
                }
            }
        }
        LinkGate::Up
    }

    fn note_miss(&self, step: &mut Instruction, pattern: &str, channel: ChannelId) {
        step.state.attempts_left += 1;
        let limit = self.settings.stall_warning_misses;
        if limit > 0 && step.state.attempts_left >= limit {
            let message = format!(
                "still waiting for '{pattern}' on {channel} after {limit} checks: {}",
                step.text
            );
            eprintln!("[ARIG-RUN] {}: {message}", self.name);
            self.sink.note(&self.name, &message);
            step.state.attempts_left = 0;
        }
    }

    fn complete(&self, state: &mut RunState, actual: Option<String>) {
        let index = state.list.cursor();
        let attempt = state.policy.current_attempt();
        let expected = state.list.current().resolved_desired(&state.vars);
        let step = state.list.current_mut();
        step.state.check_completed = true;
        step.state.error_text = None;
        if actual.is_some() {
            step.state.actual_output.clone_from(&actual);
        }

        match step.timing {
            Some(TimingMark::Start) => state.timer_start = Some(Instant::now()),
            Some(TimingMark::Stop) => {
                if let Some(start) = state.timer_start.take() {
                    let secs = start.elapsed().as_secs();
                    self.sink.record_point(&TestPointOutcome {
                        test_name: self.name.clone(),
                        instruction_index: index,
                        expected_output: "Execution Time".to_string(),
                        actual_output: format!("Execution Time : {secs} s"),
                        verdict: Verdict::Additional,
                        attempt_number: attempt,
                    });
                }
            }
            None => {}
        }

        if !step.state.replies_sent && !step.reply.is_empty() {
            step.state.replies_sent = true;
            if let Some(channel) = step.reply_channel() {
                for line in &step.reply {
                    if let Err(e) = self.transport.send(channel, line) {
                        eprintln!("[ARIG-RUN] {}: reply on {channel} failed: {e}", self.name);
                        self.sink.note(&self.name, &e.to_string());
                        step.state.error_text = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        if let Some(expected) = expected {
            if !step.state.result_emitted {
                step.state.result_emitted = true;
                self.sink.record_point(&TestPointOutcome {
                    test_name: self.name.clone(),
                    instruction_index: index,
                    expected_output: expected,
                    actual_output: actual.unwrap_or_default(),
                    verdict: Verdict::Pass,
                    attempt_number: attempt,
                });
            }
        }
    }

    fn fail(&self, state: &mut RunState, failure: Failure) -> TickOutcome {
        let attempt = state.policy.current_attempt();
        let expected = expected_text(state.list.current(), &state.vars);
        state.status = RunStatus::Failed;
        let step = state.list.current_mut();
        step.state.error_text = Some(failure.message.clone());
        if !failure.actual.is_empty() {
            step.state.actual_output = Some(failure.actual.clone());
        }
        if !step.state.result_emitted {
            step.state.result_emitted = true;
            self.sink.record_point(&TestPointOutcome {
                test_name: self.name.clone(),
                instruction_index: failure.instruction_index,
                expected_output: expected,
                actual_output: failure.message.clone(),
                verdict: Verdict::Fail,
                attempt_number: attempt,
            });
        }
        eprintln!("[ARIG-RUN] {} attempt {attempt} failed at {failure}", self.name);
        state.failure = Some(failure.clone());
        TickOutcome::Failed(failure)
    }

    // ──────────────────── timed waits ────────────────────

    /// Sleep in slices; `false` if an abort arrived first.
    fn pause(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_abort_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }

    fn await_activity(&self, channel: ChannelId) -> bool {
        let buffer = self.terminals.buffer(channel);
        let deadline = Instant::now() + self.settings.power_on_timeout;
        loop {
            if !buffer.is_empty() {
                return true;
            }
            if self.is_abort_requested() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_SLICE);
        }
    }

    fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    // ──────────────────── operator operations ────────────────────

    /// Begin an attempt. Returns its 1-based number.
    pub fn start(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if state.policy.is_inhibited() {
            return Err(RigError::TestInhibited {
                test: self.name.clone(),
                attempts: state.policy.attempts(),
            });
        }
        if state.status != RunStatus::NotStarted {
            return Err(self.transition_error(state.status, RunStatus::InProgress));
        }
        self.abort_requested.store(false, Ordering::Release);
        state.list.reset();
        let base = state.base_vars.clone();
        state.vars = base;
        state.failure = None;
        state.timer_start = None;
        state.transfer = self.transfer.as_ref().map(|_| TransferProgress::new());
        state.concluded = false;
        self.terminals.clear_buffers();
        self.terminals.set_capture(true);
        state.status = RunStatus::InProgress;

        let attempt = state.policy.current_attempt();
        eprintln!(
            "[ARIG-RUN] {} attempt {attempt}/{} started",
            self.name,
            state.policy.max_attempts()
        );
        self.sink.run_started(&self.name, attempt);
        Ok(attempt)
    }

    /// Move past the current step if it allows leaving.
    pub fn advance(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != RunStatus::InProgress {
            return false;
        }
        let current = state.list.current();
        if current.user_ack_required && !current.state.acknowledged {
            return false;
        }
        state.list.advance()
    }

    pub fn step_back(&self) -> bool {
        let mut state = self.state.lock();
        state.status == RunStatus::InProgress && state.list.step_back()
    }

    /// Operator confirmation for the current step; advances when the step is
    /// already complete. Returns whether the cursor moved.
    pub fn acknowledge(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != RunStatus::InProgress {
            return false;
        }
        state.list.current_mut().state.acknowledged = true;
        state.list.current().is_complete() && state.list.advance()
    }

    /// Fail the current attempt on operator request. Counts toward the bound.
    pub fn request_restart(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != RunStatus::InProgress {
            return Err(self.transition_error(state.status, RunStatus::Failed));
        }
        self.sink.restart_requested(&self.name);
        let index = state.list.cursor();
        self.fail(
            &mut state,
            Failure::new(FailureKind::OperatorRestart, index, "", ""),
        );
        Ok(())
    }

    /// Abort without counting a failure. Returns whether a run was stopped.
    pub fn abort(&self) -> bool {
        self.abort_requested.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if state.status != RunStatus::InProgress {
            return false;
        }
        state.status = RunStatus::Restarting;
        self.terminals.set_capture(false);
        self.sink.abort_requested(&self.name, "operator");
        eprintln!("[ARIG-RUN] {} aborted", self.name);
        true
    }

    /// Apply the attempt policy after a terminal status.
    pub fn conclude(&self) -> RunConclusion {
        let mut state = self.state.lock();
        let attempt = state.policy.current_attempt();
        match state.status {
            RunStatus::Completed => {
                if !state.concluded {
                    state.concluded = true;
                    self.record_run(&state, RunStatus::Completed);
                    self.terminals.set_capture(false);
                    self.dispose_logs(attempt);
                }
                RunConclusion::Passed { attempt }
            }
            RunStatus::Failed => {
                self.record_run(&state, RunStatus::Failed);
                self.reset(&mut state, attempt);
                let retry = state.policy.record_failure();
                state.status = RunStatus::NotStarted;
                let attempts = state.policy.attempts();
                if retry {
                    RunConclusion::Retry {
                        attempts,
                        remaining: state.policy.remaining(),
                    }
                } else {
                    eprintln!(
                        "[ARIG-RUN] {} inhibited after {attempts} failed attempts",
                        self.name
                    );
                    RunConclusion::Exhausted { attempts }
                }
            }
            RunStatus::Restarting => {
                self.record_run(&state, RunStatus::Restarting);
                self.reset(&mut state, attempt);
                state.status = RunStatus::NotStarted;
                RunConclusion::Reset
            }
            RunStatus::NotStarted | RunStatus::InProgress => RunConclusion::Pending,
        }
    }

    /// Clear the failure count so an inhibited or passed test may run again.
    pub fn override_inhibit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status == RunStatus::InProgress {
            return Err(self.transition_error(state.status, RunStatus::NotStarted));
        }
        state.policy.reset();
        state.status = RunStatus::NotStarted;
        state.concluded = false;
        self.sink.note(&self.name, "attempt count overridden");
        Ok(())
    }

    /// Set a run variable used for `{name}` placeholders, for this attempt and
    /// every later one.
    pub fn set_var(&self, name: &str, value: &str) {
        let mut state = self.state.lock();
        state.base_vars.insert(name.to_string(), value.to_string());
        state.vars.insert(name.to_string(), value.to_string());
    }

    fn reset(&self, state: &mut RunState, attempt: u32) {
        state.list.reset();
        state.vars.clone_from(&state.base_vars);
        state.failure = None;
        state.timer_start = None;
        state.transfer = None;
        self.terminals.set_capture(false);
        self.terminals.clear_buffers();
        self.dispose_logs(attempt);
    }

    fn dispose_logs(&self, attempt: u32) {
        let Some(dir) = &self.settings.log_dir else {
            self.terminals.clear_logs();
            return;
        };
        match self
            .terminals
            .flush_logs(dir, &format!("{}_attempt{attempt}", self.name))
        {
            Ok(paths) => {
                for path in paths {
                    eprintln!("[ARIG-RUN] terminal log written to {}", path.display());
                }
            }
            Err(e) => {
                eprintln!("[ARIG-RUN] terminal log export failed: {e}");
                self.terminals.clear_logs();
            }
        }
    }

    fn record_run(&self, state: &RunState, status: RunStatus) {
        self.sink.record_run(&RunRecord {
            test_name: self.name.clone(),
            attempt_number: state.policy.current_attempt(),
            status,
            failure: state.failure.as_ref().map(|f| f.message.clone()),
            completed_steps: state.list.completed_count(),
            total_steps: state.list.len(),
        });
    }

    fn transition_error(&self, from: RunStatus, to: RunStatus) -> RigError {
        RigError::InvalidTransition {
            test: self.name.clone(),
            from: from.as_str(),
            to: to.as_str(),
        }
    }

    // ──────────────────── queries ────────────────────

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    /// Counted failures.
    pub fn attempts(&self) -> u32 {
        self.state.lock().policy.attempts()
    }

    pub fn is_inhibited(&self) -> bool {
        self.state.lock().policy.is_inhibited()
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().list.cursor()
    }

    pub fn current_instruction(&self) -> Instruction {
        self.state.lock().list.current().clone()
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        self.state.lock().list.iter().cloned().collect()
    }

    pub fn failure(&self) -> Option<Failure> {
        self.state.lock().failure.clone()
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.state.lock().vars.get(name).cloned()
    }

    pub fn checkpoints(&self) -> Vec<(usize, String)> {
        self.state
            .lock()
            .list
            .checkpoints()
            .into_iter()
            .map(|(i, label)| (i, label.to_string()))
            .collect()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let state = self.state.lock();
        let current = state.list.current();
        RunSnapshot {
            test_name: self.name.clone(),
            status: state.status,
            cursor: state.list.cursor(),
            total_steps: state.list.len(),
            completed_steps: state.list.completed_count(),
            attempts: state.policy.attempts(),
            inhibited: state.policy.is_inhibited(),
            current_text: current.text.clone(),
            error_text: current.state.error_text.clone(),
        }
    }
}

fn expected_text(step: &Instruction, vars: &BTreeMap<String, String>) -> String {
    step.resolved_desired(vars)
        .unwrap_or_else(|| step.text.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::checks::{MismatchThreshold, SpecialCheckHandler};
    use crate::sequencer::outcome::MemorySink;
    use crate::terminal::buffer::ChannelBuffer;
    use crate::transport::loopback::LoopbackTransport;
    use crossbeam_channel::{Receiver, Sender, bounded};

    struct Rig {
        run: Arc<TestRun>,
        terminals: Arc<TerminalPair>,
        transport: Arc<LoopbackTransport>,
        sink: Arc<MemorySink>,
    }

    fn rig_with(profile: TestProfile) -> Rig {
        let terminals = Arc::new(TerminalPair::new(256));
        let transport = Arc::new(LoopbackTransport::connected());
        let sink = Arc::new(MemorySink::new());
        let run = Arc::new(TestRun::new(
            profile,
            Arc::clone(&terminals),
            transport.clone(),
            sink.clone(),
        ));
        Rig {
            run,
            terminals,
            transport,
            sink,
        }
    }

    fn rig(steps: Vec<Instruction>) -> Rig {
        let settings = RunSettings {
            power_on_timeout: Duration::from_millis(50),
            ..RunSettings::default()
        };
        rig_with(
            TestProfile::new("Bench", InstructionList::new(steps).unwrap()).with_settings(settings),
        )
    }

    fn feed(rig: &Rig, channel: ChannelId, text: &str) {
        rig.terminals.ingest(channel, text.as_bytes());
    }

    #[test]
    fn display_step_completes_and_advances_in_one_cycle() {
        let r = rig(vec![
            Instruction::display("Connect harness"),
            Instruction::expect("Power on", ChannelId::Boot, "MMCSD boot"),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
        assert!(r.run.advance());
        assert_eq!(r.run.cursor(), 1);
        assert!(r.sink.points().is_empty(), "display steps emit no result");
    }

    #[test]
    fn run_variable_set_before_start_survives_every_attempt() {
        let r = rig(vec![
            Instruction::expect("Copy", ChannelId::Main, "verified {bytes} bytes"),
            Instruction::display("Done"),
        ]);
        r.run.set_var("bytes", "4096");
        r.run.start().unwrap();
        assert_eq!(r.run.var("bytes").as_deref(), Some("4096"));
        feed(&r, ChannelId::Main, "verified 4096 bytes\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });

        r.run.request_restart().unwrap();
        r.run.conclude();
        r.run.set_var("bytes", "8192");
        r.run.start().unwrap();
        feed(&r, ChannelId::Main, "verified 4096 bytes\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        feed(&r, ChannelId::Main, "verified 8192 bytes\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
    }

    fn transfer_rig(transfer: TransferSpec) -> Rig {
        let steps = vec![
            Instruction::expect("Menu", ChannelId::Main, "Formal tests"),
            Instruction::display("Done"),
        ];
        rig_with(
            TestProfile::new("Firmware", InstructionList::new(steps).unwrap())
                .with_transfer(transfer),
        )
    }

    #[test]
    fn usb_transfer_precedes_the_first_step() {
        let r = transfer_rig(TransferSpec::new("rc /FIRM"));
        r.run.start().unwrap();
        feed(&r, ChannelId::Main, "Formal tests        B\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting, "no banner yet");

        feed(&r, ChannelId::Boot, "*** USB Utility Application\r\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        assert_eq!(r.transport.sent_on(ChannelId::Boot), vec!["rc /FIRM"]);

        feed(&r, ChannelId::Boot, "Copying...\r\nDONE!\r\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
        assert!(
            r.sink.notes().iter().any(|n| n.contains("test image transferred")),
            "notes: {:?}",
            r.sink.notes()
        );
    }

    #[test]
    fn missing_usb_utility_resets_without_counting() {
        let mut transfer = TransferSpec::new("rc /FIRM");
        transfer.banner_timeout_ms = 0;
        let r = transfer_rig(transfer);
        r.run.start().unwrap();
        let TickOutcome::Failed(failure) = r.run.evaluate() else {
            panic!("expected transfer failure");
        };
        assert_eq!(failure.kind, FailureKind::UsbTransfer);
        assert_eq!(failure.message, "Failed to Load USB application !");
        assert_eq!(r.run.status(), RunStatus::Restarting);
        assert_eq!(r.run.conclude(), RunConclusion::Reset);
        assert_eq!(r.run.attempts(), 0);
        assert!(r.transport.sent().is_empty());
    }

    #[test]
    fn evaluate_before_start_is_idle() {
        let r = rig(vec![Instruction::display("x")]);
        assert_eq!(r.run.evaluate(), TickOutcome::Idle);
    }

    #[test]
    fn substring_match_completes_and_emits_pass_once() {
        let r = rig(vec![
            Instruction::expect("Power on", ChannelId::Boot, "MMCSD boot"),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        feed(&r, ChannelId::Boot, "U-Boot SPL\r\nTrying to boot from MMCSD boot\r\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });

        let points = r.sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].verdict, Verdict::Pass);
        assert_eq!(points[0].actual_output, "Trying to boot from MMCSD boot");
        assert_eq!(points[0].attempt_number, 1);
    }

    #[test]
    fn suppressed_evidence_cannot_satisfy_next_step() {
        let r = rig(vec![
            Instruction::expect("First prompt", ChannelId::Main, "Enter choice").suppressing(),
            Instruction::expect("Second prompt", ChannelId::Main, "Enter choice"),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Main, "Enter choice:\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
        assert!(r.run.advance());
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        feed(&r, ChannelId::Main, "Enter choice:\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 1 });
    }

    #[test]
    fn replies_are_sent_once_on_completion() {
        let r = rig(vec![
            Instruction::expect("Menu", ChannelId::Main, "Formal tests").with_reply(["B", "A"]),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Main, "Formal tests        B\n");
        r.run.evaluate();
        r.run.evaluate();
        assert_eq!(r.transport.sent_on(ChannelId::Main), vec!["B", "A"]);
    }

    #[test]
    fn mismatch_threshold_fails_at_sixty_five_not_sixty_four() {
        let steps = vec![
            Instruction::expect("DDR test", ChannelId::Main, "DDR test complete"),
            Instruction::display("Done"),
        ];
        let profile = TestProfile::new("DDR", InstructionList::new(steps).unwrap())
            .with_termination(MismatchThreshold {
                channel: ChannelId::Main,
                marker: "(MISMATCH)".to_string(),
                threshold: 64,
            });
        let r = rig_with(profile);
        r.run.start().unwrap();
        for i in 0..64 {
            feed(&r, ChannelId::Main, &format!("0x{i:04x} (MISMATCH)\n"));
        }
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        feed(&r, ChannelId::Main, "0x0040 (MISMATCH)\n");
        let TickOutcome::Failed(failure) = r.run.evaluate() else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::MismatchThreshold);
        assert_eq!(failure.message, "ERROR : Too many MISMATCH");
        assert_eq!(
            r.run.current_instruction().state.error_text.as_deref(),
            Some("ERROR : Too many MISMATCH")
        );
    }

    #[test]
    fn failure_is_latched_and_reported_once() {
        let r = rig(vec![
            Instruction::expect("ADC", ChannelId::Main, "ADC0 AIN6").with_special(
                SpecialCheck::Range {
                    label: "voltage".to_string(),
                    min: 1215,
                    max: 1235,
                },
            ),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Main, "ADC0 AIN6 voltage: 1200mV\n");
        assert!(matches!(r.run.evaluate(), TickOutcome::Failed(_)));
        assert_eq!(r.run.evaluate(), TickOutcome::Idle);
        assert_eq!(r.run.evaluate(), TickOutcome::Idle);
        let points = r.sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].verdict, Verdict::Fail);
        assert_eq!(points[0].actual_output, "ADC0 AIN6 voltage: 1200mV");
        assert_eq!(r.run.status(), RunStatus::Failed);
    }

    #[test]
    fn three_failures_inhibit_until_override() {
        let r = rig(vec![
            Instruction::expect("Boot", ChannelId::Boot, "MMCSD boot"),
            Instruction::display("Done"),
        ]);
        for expected_attempts in 1..=3 {
            r.run.start().unwrap();
            r.run.request_restart().unwrap();
            let conclusion = r.run.conclude();
            assert_eq!(r.run.attempts(), expected_attempts);
            if expected_attempts < 3 {
                assert_eq!(
                    conclusion,
                    RunConclusion::Retry {
                        attempts: expected_attempts,
                        remaining: 3 - expected_attempts
                    }
                );
            } else {
                assert_eq!(conclusion, RunConclusion::Exhausted { attempts: 3 });
            }
        }
        assert!(r.run.is_inhibited());
        let err = r.run.start().unwrap_err();
        assert_eq!(err.code(), "ARIG-4001");

        r.run.override_inhibit().unwrap();
        assert_eq!(r.run.attempts(), 0);
        assert_eq!(r.run.start().unwrap(), 1);
    }

    #[test]
    fn abort_resets_without_counting() {
        let r = rig(vec![
            Instruction::expect("Boot", ChannelId::Boot, "MMCSD boot"),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Boot, "partial evidence\n");
        assert!(r.run.abort());
        assert_eq!(r.run.status(), RunStatus::Restarting);
        assert_eq!(r.run.evaluate(), TickOutcome::Idle);
        assert_eq!(r.run.conclude(), RunConclusion::Reset);
        assert_eq!(r.run.attempts(), 0);
        assert!(r.terminals.buffer(ChannelId::Boot).is_empty());
        assert_eq!(r.run.status(), RunStatus::NotStarted);
        assert_eq!(r.run.start().unwrap(), 1);
    }

    #[test]
    fn failed_conclusion_rewinds_and_clears_buffers() {
        let r = rig(vec![
            Instruction::display("Intro"),
            Instruction::expect("Boot", ChannelId::Boot, "MMCSD boot"),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        r.run.evaluate();
        r.run.advance();
        feed(&r, ChannelId::Boot, "noise\n");
        r.run.request_restart().unwrap();
        r.run.conclude();
        assert_eq!(r.run.cursor(), 0);
        assert!(r.terminals.buffer(ChannelId::Boot).is_empty());
        assert!(r.terminals.terminal(ChannelId::Boot).log().is_empty());
        assert!(r.run.failure().is_none());
    }

    #[test]
    fn restart_outside_run_is_invalid_transition() {
        let r = rig(vec![Instruction::display("x")]);
        let err = r.run.request_restart().unwrap_err();
        assert_eq!(err.code(), "ARIG-4002");
    }

    #[test]
    fn completed_run_concludes_as_passed_and_refuses_rerun() {
        let r = rig(vec![
            Instruction::display("Intro"),
            Instruction::expect("Boot", ChannelId::Boot, "MMCSD boot"),
        ]);
        r.run.start().unwrap();
        r.run.evaluate();
        r.run.advance();
        feed(&r, ChannelId::Boot, "MMCSD boot\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Finished);
        assert_eq!(r.run.conclude(), RunConclusion::Passed { attempt: 1 });
        assert_eq!(r.run.conclude(), RunConclusion::Passed { attempt: 1 });
        assert_eq!(r.sink.runs().len(), 1);
        assert_eq!(r.run.start().unwrap_err().code(), "ARIG-4002");
    }

    #[test]
    fn ack_required_step_waits_for_operator() {
        let r = rig(vec![
            Instruction::expect("Check LEDs", ChannelId::Main, "LED test").requiring_ack(),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Main, "LED test running\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
        assert!(!r.run.advance());
        assert!(r.run.acknowledge());
        assert_eq!(r.run.cursor(), 1);
    }

    #[test]
    fn step_back_only_onto_completed_step() {
        let r = rig(vec![
            Instruction::display("Intro"),
            Instruction::expect("Boot", ChannelId::Boot, "MMCSD boot"),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        assert!(!r.run.step_back());
        r.run.evaluate();
        r.run.advance();
        assert!(r.run.step_back());
        assert_eq!(r.run.cursor(), 0);
    }

    #[test]
    fn timing_pair_reports_execution_time() {
        let r = rig(vec![
            Instruction::expect("Boot start", ChannelId::Boot, "U-Boot SPL")
                .with_timing(TimingMark::Start),
            Instruction::expect("Boot end", ChannelId::Boot, "login:").with_timing(TimingMark::Stop),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Boot, "U-Boot SPL 2021.01\n");
        r.run.evaluate();
        r.run.advance();
        feed(&r, ChannelId::Boot, "am64xx login:\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Finished);
        let timing: Vec<_> = r
            .sink
            .points()
            .into_iter()
            .filter(|p| p.verdict == Verdict::Additional)
            .collect();
        assert_eq!(timing.len(), 1);
        assert_eq!(timing[0].actual_output, "Execution Time : 0 s");
    }

    #[test]
    fn byte_count_capture_feeds_later_placeholder() {
        let r = rig(vec![
            Instruction::expect("Copy", ChannelId::Boot, "Bytes to copy").with_special(
                SpecialCheck::ByteCount {
                    label: "copy".to_string(),
                    capture_as: Some("bytes".to_string()),
                },
            ),
            Instruction::expect("Verify", ChannelId::Boot, "Copied bytes: {bytes}  of  {bytes}"),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Boot, "Bytes to copy: 8192\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
        assert_eq!(r.run.var("bytes").as_deref(), Some("8192"));
        r.run.advance();
        feed(&r, ChannelId::Boot, "Copied bytes: 4096  of  8192\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        feed(&r, ChannelId::Boot, "Copied bytes: 8192  of  8192\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Finished);
    }

    #[test]
    fn forbidden_token_fails_with_wrong_source() {
        let r = rig(vec![
            Instruction::expect("Boot", ChannelId::Boot, "MMCSD boot")
                .forbidding(["QSPI boot", "USBMSC boot"], 0),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        feed(&r, ChannelId::Boot, "Trying QSPI boot\n");
        let TickOutcome::Failed(failure) = r.run.evaluate() else {
            panic!("expected wrong source");
        };
        assert_eq!(failure.kind, FailureKind::WrongSource);
        assert_eq!(failure.message, "ERROR: Loading from unknown/wrong device");
    }

    #[test]
    fn silent_channel_reports_power_not_on() {
        let r = rig(vec![
            Instruction::expect("Power on", ChannelId::Boot, "MMCSD boot").awaiting_activity(),
            Instruction::display("Done"),
        ]);
        r.run.start().unwrap();
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        assert_eq!(
            r.run.current_instruction().state.error_text.as_deref(),
            Some(POWER_NOT_ON)
        );
        feed(&r, ChannelId::Boot, "MMCSD boot\n");
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
        assert_eq!(r.run.current_instruction().state.error_text, None);
    }

    #[test]
    fn link_gate_waits_for_first_connection() {
        let transport = Arc::new(LoopbackTransport::new());
        let run = TestRun::new(
            TestProfile::new(
                "Links",
                InstructionList::new(vec![
                    Instruction::link_gate("Connect BOOT", ChannelId::Boot),
                    Instruction::display("Done"),
                ])
                .unwrap(),
            ),
            Arc::new(TerminalPair::new(16)),
            transport.clone(),
            Arc::new(MemorySink::new()),
        );
        run.start().unwrap();
        assert_eq!(run.evaluate(), TickOutcome::Waiting);
        assert_eq!(run.evaluate(), TickOutcome::Waiting);
        assert!(
            transport.reconnect_calls().is_empty(),
            "never-seen link is not reconnected"
        );
        transport.set_link(ChannelId::Boot, true);
        assert_eq!(run.evaluate(), TickOutcome::Completed { index: 0 });
    }

    #[test]
    fn dropped_link_fails_after_bounded_reconnects() {
        let r = rig(vec![
            Instruction::link_gate("Keep BOOT up", ChannelId::Boot),
            Instruction::display("Done"),
        ]);
        r.transport.set_link(ChannelId::Boot, false);
        r.run.start().unwrap();
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        assert_eq!(r.run.evaluate(), TickOutcome::Waiting);
        let TickOutcome::Failed(failure) = r.run.evaluate() else {
            panic!("expected link-down failure");
        };
        assert_eq!(
            failure.kind,
            FailureKind::LinkDown {
                channel: ChannelId::Boot
            }
        );
        assert_eq!(failure.message, "BOOT terminal not connected");
        assert_eq!(r.transport.reconnect_calls().len(), 3);
    }

    #[test]
    fn successful_reconnect_lets_gate_pass() {
        let r = rig(vec![
            Instruction::link_gate("Keep MAIN up", ChannelId::Main),
            Instruction::display("Done"),
        ]);
        r.transport.set_link(ChannelId::Main, false);
        r.transport.script_reconnect(true);
        r.run.start().unwrap();
        assert_eq!(r.run.evaluate(), TickOutcome::Completed { index: 0 });
    }

    #[test]
    fn stall_warning_resets_miss_counter() {
        let settings = RunSettings {
            stall_warning_misses: 3,
            ..RunSettings::default()
        };
        let r = rig_with(
            TestProfile::new(
                "Stall",
                InstructionList::new(vec![
                    Instruction::expect("Boot", ChannelId::Boot, "MMCSD boot"),
                    Instruction::display("Done"),
                ])
                .unwrap(),
            )
            .with_settings(settings),
        );
        r.run.start().unwrap();
        for _ in 0..4 {
            r.run.evaluate();
        }
        assert_eq!(r.sink.notes().len(), 1);
        assert!(r.sink.notes()[0].contains("MMCSD boot"));
        assert_eq!(r.run.current_instruction().state.attempts_left, 1);
    }

    struct BlockingCheck {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl SpecialCheckHandler for BlockingCheck {
        fn evaluate(
            &self,
            _instruction: &Instruction,
            _pattern: &str,
            _buffer: &ChannelBuffer,
        ) -> SpecialOutcome {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            SpecialOutcome::Passed {
                actual: "released".to_string(),
                capture: None,
            }
        }
    }

    #[test]
    fn overlapping_evaluations_skip_instead_of_blocking() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let profile = TestProfile::new(
            "Overlap",
            InstructionList::new(vec![
                Instruction::expect("Section", ChannelId::Main, "Walking ones")
                    .with_special(SpecialCheck::SectionStatus),
                Instruction::display("Done"),
            ])
            .unwrap(),
        )
        .with_special_handler(Arc::new(BlockingCheck {
            entered: entered_tx,
            release: release_rx,
        }));
        let r = rig_with(profile);
        r.run.start().unwrap();

        let run = Arc::clone(&r.run);
        let first = thread::spawn(move || run.evaluate());
        entered_rx.recv().unwrap();
        assert_eq!(r.run.evaluate(), TickOutcome::Skipped);
        release_tx.send(()).unwrap();
        assert_eq!(first.join().unwrap(), TickOutcome::Completed { index: 0 });
    }

    #[test]
    fn abort_interrupts_power_on_wait() {
        let settings = RunSettings {
            power_on_timeout: Duration::from_secs(30),
            ..RunSettings::default()
        };
        let r = rig_with(
            TestProfile::new(
                "Abort",
                InstructionList::new(vec![
                    Instruction::expect("Power", ChannelId::Boot, "boot").awaiting_activity(),
                    Instruction::display("Done"),
                ])
                .unwrap(),
            )
            .with_settings(settings),
        );
        r.run.start().unwrap();
        let run = Arc::clone(&r.run);
        let ticker = thread::spawn(move || run.evaluate());
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        assert!(r.run.abort());
        assert_eq!(ticker.join().unwrap(), TickOutcome::Idle);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
