//! Logger thread: owns the [`JsonlWriter`], fed by a bounded channel.
//!
//! Producers (the sequencer, the runner, the CLI) never block on logging:
//! `try_send` drops the event when the channel is full and counts the drop.
//! The thread reports accumulated drops before the next event it writes.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, RigError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::sequencer::outcome::{ResultSink, RunRecord, TestPointOutcome, Verdict};
use crate::sequencer::policy::RunStatus;
use crate::terminal::ChannelId;

pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    SessionStarted {
        version: String,
        config_hash: String,
        script: String,
    },
    SessionStopped {
        reason: String,
    },
    TestStarted {
        test: String,
        attempt: u32,
    },
    TestPoint(TestPointOutcome),
    RunFinished(RunRecord),
    RestartRequested {
        test: String,
    },
    AbortRequested {
        test: String,
        reason: String,
    },
    LinkChanged {
        channel: ChannelId,
        connected: bool,
    },
    Diagnostic {
        test: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Flush, fsync, and stop the thread.
    Shutdown,
}

/// Cheap to clone; every clone feeds the same logger thread.
#[derive(Debug, Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Never blocks. A full channel drops the event.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Blocking send of the shutdown sentinel so it is never the event dropped.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

impl ResultSink for ActivityLoggerHandle {
    fn record_point(&self, outcome: &TestPointOutcome) {
        self.send(ActivityEvent::TestPoint(outcome.clone()));
    }

    fn record_run(&self, record: &RunRecord) {
        self.send(ActivityEvent::RunFinished(record.clone()));
    }

    fn run_started(&self, test_name: &str, attempt_number: u32) {
        self.send(ActivityEvent::TestStarted {
            test: test_name.to_string(),
            attempt: attempt_number,
        });
    }

    fn link_changed(&self, channel: ChannelId, connected: bool) {
        self.send(ActivityEvent::LinkChanged { channel, connected });
    }

    fn restart_requested(&self, test_name: &str) {
        self.send(ActivityEvent::RestartRequested {
            test: test_name.to_string(),
        });
    }

    fn abort_requested(&self, test_name: &str, reason: &str) {
        self.send(ActivityEvent::AbortRequested {
            test: test_name.to_string(),
            reason: reason.to_string(),
        });
    }

    fn note(&self, test_name: &str, message: &str) {
        self.send(ActivityEvent::Diagnostic {
            test: test_name.to_string(),
            message: message.to_string(),
        });
    }
}

pub fn spawn_logger(
    config: JsonlConfig,
    capacity: usize,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped: Arc::clone(&dropped),
    };
    let join = thread::Builder::new()
        .name("arig-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped))
        .map_err(|e| RigError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;
    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(config);
    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            writer.write_entry(
                &LogEntry::new(EventType::Diagnostic, Severity::Warning)
                    .with_details(format!("{lost} events dropped under back-pressure")),
            );
        }
        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        writer.write_entry(&to_entry(event));
    }
    writer.sync();
}

fn to_entry(event: ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::SessionStarted {
            version,
            config_hash,
            script,
        } => LogEntry::new(EventType::SessionStart, Severity::Info).with_details(format!(
            "version={version} config_hash={config_hash} script={script}"
        )),
        ActivityEvent::SessionStopped { reason } => {
            LogEntry::new(EventType::SessionStop, Severity::Info).with_details(reason)
        }
        ActivityEvent::TestStarted { test, attempt } => {
            LogEntry::new(EventType::TestStart, Severity::Info).for_test(&test, attempt)
        }
        ActivityEvent::TestPoint(point) => {
            let severity = match point.verdict {
                Verdict::Fail => Severity::Error,
                Verdict::Pass | Verdict::Additional => Severity::Info,
            };
            let mut e = LogEntry::new(EventType::TestPoint, severity)
                .for_test(&point.test_name, point.attempt_number);
            e.step = Some(point.instruction_index);
            e.expected = Some(point.expected_output);
            e.actual = Some(point.actual_output);
            e.verdict = Some(point.verdict.to_string().to_lowercase());
            e
        }
        ActivityEvent::RunFinished(record) => {
            let severity = match record.status {
                RunStatus::Failed => Severity::Error,
                RunStatus::Restarting => Severity::Warning,
                _ => Severity::Info,
            };
            let mut e = LogEntry::new(EventType::RunFinished, severity)
                .for_test(&record.test_name, record.attempt_number)
                .with_details(format!(
                    "{}/{} steps complete",
                    record.completed_steps, record.total_steps
                ));
            e.status = Some(record.status.as_str().to_string());
            e.actual = record.failure;
            e
        }
        ActivityEvent::RestartRequested { test } => {
            let mut e = LogEntry::new(EventType::RestartRequested, Severity::Warning);
            e.test = Some(test);
            e
        }
        ActivityEvent::AbortRequested { test, reason } => {
            let mut e =
                LogEntry::new(EventType::AbortRequested, Severity::Warning).with_details(reason);
            e.test = Some(test);
            e
        }
        ActivityEvent::LinkChanged { channel, connected } => {
            let mut e = LogEntry::new(
                EventType::LinkChange,
                if connected {
                    Severity::Info
                } else {
                    Severity::Warning
                },
            );
            e.channel = Some(channel.to_string());
            e.status = Some(if connected { "up" } else { "down" }.to_string());
            e
        }
        ActivityEvent::Diagnostic { test, message } => {
            let mut e = LogEntry::new(EventType::Diagnostic, Severity::Info).with_details(message);
            e.test = Some(test);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Error).with_details(message);
            e.error_code = Some(code);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::SessionStop, Severity::Info),
    }
}
