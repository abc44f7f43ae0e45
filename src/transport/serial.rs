//! Physical serial links via `serialport`.
//!
//! Each open port gets a reader thread that pulls with a short timeout and
//! hands chunks to the ingest queue. A read error marks the link down; the
//! sequencer then decides whether to call [`Transport::reconnect`].

#![allow(missing_docs)]

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serialport::{SerialPort, SerialPortType};

use crate::core::config::SerialConfig;
use crate::core::errors::{Result, RigError};
use crate::terminal::ChannelId;
use crate::terminal::ingest::IngestHandle;
use crate::transport::{LinkFlags, LinkSnapshot, Transport};

const READ_CHUNK: usize = 256;

/// A port the OS reports as present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub kind: String,
}

/// Enumerate serial ports for `arig ports`.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(|e| RigError::PortUnavailable {
        port: "<enumerate>".to_string(),
        details: e.to_string(),
    })?;
    Ok(ports
        .into_iter()
        .map(|p| PortInfo {
            kind: describe_port_type(&p.port_type),
            name: p.port_name,
        })
        .collect())
}

fn describe_port_type(kind: &SerialPortType) -> String {
    match kind {
        SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("usb");
            format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid)
        }
        SerialPortType::PciPort => "pci".to_string(),
        SerialPortType::BluetoothPort => "bluetooth".to_string(),
        SerialPortType::Unknown => "unknown".to_string(),
    }
}

struct PortSlot {
    channel: ChannelId,
    path: Option<String>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    flags: Arc<LinkFlags>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PortSlot {
    fn new(channel: ChannelId, path: Option<String>) -> Self {
        Self {
            channel,
            path,
            writer: Mutex::new(None),
            flags: Arc::new(LinkFlags::default()),
            reader: Mutex::new(None),
        }
    }
}

/// MAIN and BOOT serial ports feeding one ingest queue.
pub struct SerialTransport {
    main: PortSlot,
    boot: PortSlot,
    baud_rate: u32,
    read_timeout: Duration,
    line_ending: String,
    ingest: IngestHandle,
    shutdown: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Build from config; ports are not opened until [`Self::open_all`].
    pub fn new(config: &SerialConfig, ingest: IngestHandle) -> Self {
        Self {
            main: PortSlot::new(ChannelId::Main, config.main_port.clone()),
            boot: PortSlot::new(ChannelId::Boot, config.boot_port.clone()),
            baud_rate: config.baud_rate,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            line_ending: config.write_line_ending.clone(),
            ingest,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    const fn slot(&self, channel: ChannelId) -> &PortSlot {
        match channel {
            ChannelId::Main => &self.main,
            ChannelId::Boot => &self.boot,
        }
    }

    /// Open every configured port. A port that fails to open stays down and is
    /// reported on stderr; the run's link gates decide what that means.
    pub fn open_all(&self) -> usize {
        ChannelId::ALL
            .into_iter()
            .filter(|&ch| self.slot(ch).path.is_some())
            .filter(|&ch| match self.open(ch) {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("[ARIG-SERIAL] {ch}: {e}");
                    false
                }
            })
            .count()
    }

    fn open(&self, channel: ChannelId) -> Result<()> {
        let slot = self.slot(channel);
        let Some(path) = slot.path.as_deref() else {
            return Err(RigError::PortUnavailable {
                port: channel.to_string(),
                details: "no port configured".to_string(),
            });
        };
        let port = serialport::new(path, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| RigError::PortUnavailable {
                port: path.to_string(),
                details: e.to_string(),
            })?;
        let reader = port.try_clone().map_err(|e| RigError::PortUnavailable {
            port: path.to_string(),
            details: format!("clone for reader failed: {e}"),
        })?;

        if let Some(old) = slot.reader.lock().take() {
            let _ = old.join();
        }
        *slot.writer.lock() = Some(port);
        slot.flags.set(true);

        let flags = Arc::clone(&slot.flags);
        let ingest = self.ingest.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name(format!("arig-serial-{}", channel.as_str().to_lowercase()))
            .spawn(move || reader_loop(channel, reader, &flags, &ingest, &shutdown))
            .map_err(|e| RigError::Runtime {
                details: format!("failed to spawn serial reader: {e}"),
            })?;
        *slot.reader.lock() = Some(handle);
        eprintln!("[ARIG-SERIAL] {channel} open on {path} at {} baud", self.baud_rate);
        Ok(())
    }

    /// Stop reader threads and drop the port handles.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for channel in ChannelId::ALL {
            let slot = self.slot(channel);
            if let Some(handle) = slot.reader.lock().take() {
                let _ = handle.join();
            }
            slot.writer.lock().take();
            slot.flags.set(false);
        }
    }
}

impl Transport for SerialTransport {
    fn send(&self, channel: ChannelId, text: &str) -> Result<()> {
        let slot = self.slot(channel);
        let mut writer = slot.writer.lock();
        let Some(port) = writer.as_mut() else {
            return Err(RigError::transport(channel, "port not open"));
        };
        let framed = format!("{text}{}", self.line_ending);
        port.write_all(framed.as_bytes())
            .and_then(|()| port.flush())
            .map_err(|e| RigError::transport(channel, e.to_string()))
    }

    fn reconnect(&self, channel: ChannelId) -> Result<bool> {
        if self.slot(channel).path.is_none() {
            return Ok(false);
        }
        match self.open(channel) {
            Ok(()) => Ok(true),
            Err(e) => {
                eprintln!("[ARIG-SERIAL] {channel} reconnect failed: {e}");
                Ok(false)
            }
        }
    }

    fn links(&self) -> LinkSnapshot {
        LinkSnapshot {
            main: self.main.flags.state(),
            boot: self.boot.flags.state(),
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(
    channel: ChannelId,
    mut port: Box<dyn SerialPort>,
    flags: &LinkFlags,
    ingest: &IngestHandle,
    shutdown: &AtomicBool,
) {
    let mut buf = [0u8; READ_CHUNK];
    while !shutdown.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if ingest.deliver(channel, &buf[..n]).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                eprintln!("[ARIG-SERIAL] {channel} read error, link down: {e}");
                flags.set(false);
                let _ = ingest.end_of_stream(channel);
                return;
            }
        }
    }
    let _ = ingest.end_of_stream(channel);
}
