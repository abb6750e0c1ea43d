// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Node power telemetry.
//!
//! The power meter publishes newline-delimited JSON frames, one object
//! per reading, mapping a device name to its draw:
//!
//!   {"gpu0": {"total": 180.5}, "gpu1": {"total": 92.0}}
//!
//! Frames can arrive faster than the control tick. Only the newest one
//! matters, so the reader thread overwrites a single slot and the
//! control loop takes whatever is there when it samples.

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::io::BufReader;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct DeviceReading {
    total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub total_watts: f64,
}

pub struct PowerCollector {
    latest: Arc<Mutex<Option<PowerSample>>>,
    shutdown: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl PowerCollector {
    pub fn connect<A: ToSocketAddrs + std::fmt::Display>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(&addr)
            .with_context(|| format!("Failed to connect to power meter at {}", addr))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("Failed to set power meter read timeout")?;

        let latest = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = {
            let latest = latest.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || Self::read_loop(stream, latest, shutdown))
        };
        Ok(Self {
            latest,
            shutdown,
            reader: Some(reader),
        })
    }

    fn read_loop(
        stream: TcpStream,
        latest: Arc<Mutex<Option<PowerSample>>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        while !shutdown.load(Ordering::Relaxed) {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    warn!("Power meter closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    warn!("Power meter read failed: {}", err);
                    break;
                }
            }
            let frame: BTreeMap<String, DeviceReading> = match serde_json::from_str(line.trim())
            {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("Malformed power frame {:?}: {}", line.trim(), err);
                    continue;
                }
            };
            let total_watts = frame.values().map(|r| r.total).sum();
            debug!("power frame: {:.1}W over {} devices", total_watts, frame.len());
            if let Ok(mut slot) = latest.lock() {
                *slot = Some(PowerSample { total_watts });
            }
        }
    }

    /// Newest reading seen so far, if any frame has arrived yet.
    pub fn latest(&self) -> Option<PowerSample> {
        self.latest.lock().ok().and_then(|slot| *slot)
    }
}

impl Drop for PowerCollector {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}
