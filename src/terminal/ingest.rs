//! Ingest queue: transport readers push raw chunks, one worker reassembles.
//!
//! The queue is unbounded so a reader thread never blocks or drops bytes;
//! reassembly cost moves entirely onto the worker. Ordering within a channel is
//! preserved because every chunk passes through the same FIFO.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::core::errors::{Result, RigError};
use crate::terminal::{ChannelId, TerminalPair};

#[derive(Debug)]
enum IngestMessage {
    Chunk { channel: ChannelId, bytes: Vec<u8> },
    EndOfStream(ChannelId),
    Shutdown,
}

/// Cheaply cloneable producer side; one clone per reader thread.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: Sender<IngestMessage>,
    chunks_sent: Arc<AtomicU64>,
}

impl IngestHandle {
    /// Hand a chunk to the worker. Never blocks.
    pub fn deliver(&self, channel: ChannelId, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.tx
            .send(IngestMessage::Chunk {
                channel,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| RigError::ChannelClosed {
                component: "ingest",
            })?;
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Signal that a channel's stream ended (port closed, capture file exhausted).
    pub fn end_of_stream(&self, channel: ChannelId) -> Result<()> {
        self.tx
            .send(IngestMessage::EndOfStream(channel))
            .map_err(|_| RigError::ChannelClosed {
                component: "ingest",
            })
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    /// Ask the worker to drain what is queued and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(IngestMessage::Shutdown);
    }
}

/// Spawn the reassembly worker feeding `terminals`.
pub fn spawn_ingest(
    terminals: Arc<TerminalPair>,
) -> Result<(IngestHandle, thread::JoinHandle<u64>)> {
    let (tx, rx) = unbounded::<IngestMessage>();
    let handle = IngestHandle {
        tx,
        chunks_sent: Arc::new(AtomicU64::new(0)),
    };

    let join = thread::Builder::new()
        .name("arig-ingest".to_string())
        .spawn(move || ingest_thread_main(&rx, &terminals))
        .map_err(|e| RigError::Runtime {
            details: format!("failed to spawn ingest thread: {e}"),
        })?;

    Ok((handle, join))
}

/// Returns the number of lines completed over the worker's lifetime.
fn ingest_thread_main(rx: &Receiver<IngestMessage>, terminals: &TerminalPair) -> u64 {
    let mut lines: u64 = 0;
    while let Ok(message) = rx.recv() {
        match message {
            IngestMessage::Chunk { channel, bytes } => {
                lines += terminals.ingest(channel, &bytes) as u64;
            }
            IngestMessage::EndOfStream(channel) => {
                lines += terminals.finish(channel) as u64;
            }
            IngestMessage::Shutdown => break,
        }
    }
    lines
}
