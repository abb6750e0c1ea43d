// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Transport seams.
//!
//! The controller only ever talks to two remote parties: the resource
//! agent (fire-and-forget mask/cap commands) and the workload runner
//! (request/reply pause-resume control). Both are addressed by a
//! per-application channel name. The wire format is one line per
//! message, `<channel> <payload>`, with the payloads defined in
//! `gfr_utils::command`; runner replies come back as one JSON line.

use anyhow::Context;
use anyhow::Result;
use gfr_utils::ResourceCommand;
use gfr_utils::RunnerCommand;
use gfr_utils::RunnerReply;
use log::debug;
use log::info;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// Fire-and-forget command channel to the resource agent.
pub trait CommandSink {
    fn send(&mut self, channel: &str, cmd: &ResourceCommand) -> Result<()>;
}

/// Request/reply channel to the workload runner.
pub trait RunnerClient {
    fn request(&mut self, channel: &str, cmd: &RunnerCommand) -> Result<RunnerReply>;
}

pub struct TcpCommandSink {
    stream: TcpStream,
}

impl TcpCommandSink {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("Failed to connect to resource agent at {}", addr))?;
        info!("Connected to resource agent at {}", addr);
        Ok(Self { stream })
    }
}

impl CommandSink for TcpCommandSink {
    fn send(&mut self, channel: &str, cmd: &ResourceCommand) -> Result<()> {
        debug!("sink: ({}) {}", channel, cmd);
        self.stream
            .write_all(format!("{} {}\n", channel, cmd).as_bytes())
            .context("Failed to send resource command")
    }
}

pub struct TcpRunnerClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpRunnerClient {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("Failed to connect to workload runner at {}", addr))?;
        let reader = BufReader::new(stream.try_clone()?);
        info!("Connected to workload runner at {}", addr);
        Ok(Self { stream, reader })
    }
}

impl RunnerClient for TcpRunnerClient {
    fn request(&mut self, channel: &str, cmd: &RunnerCommand) -> Result<RunnerReply> {
        debug!("runner: ({}) {}", channel, cmd);
        self.stream
            .write_all(format!("{} {}\n", channel, cmd).as_bytes())
            .context("Failed to send runner command")?;
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .context("Failed to read runner reply")?;
        serde_json::from_str(line.trim())
            .with_context(|| format!("Malformed runner reply: {}", line.trim()))
    }
}

/// In-process sink used by `--simulate` and the tests. Records the
/// full wire lines it would have sent.
#[derive(Default)]
pub struct SimSink {
    journal: Arc<Mutex<Vec<String>>>,
}

impl SimSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> Arc<Mutex<Vec<String>>> {
        self.journal.clone()
    }
}

impl CommandSink for SimSink {
    fn send(&mut self, channel: &str, cmd: &ResourceCommand) -> Result<()> {
        debug!("sim sink: ({}) {}", channel, cmd);
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} {}", channel, cmd));
        Ok(())
    }
}

/// In-process runner used by `--simulate` and the tests. Accepts every
/// request while `ok` holds true.
pub struct SimRunner {
    ok: Arc<AtomicBool>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl SimRunner {
    pub fn new() -> Self {
        Self {
            ok: Arc::new(AtomicBool::new(true)),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared switch flipping every subsequent reply to a rejection.
    pub fn ok_flag(&self) -> Arc<AtomicBool> {
        self.ok.clone()
    }

    pub fn journal(&self) -> Arc<Mutex<Vec<String>>> {
        self.journal.clone()
    }
}

impl Default for SimRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerClient for SimRunner {
    fn request(&mut self, channel: &str, cmd: &RunnerCommand) -> Result<RunnerReply> {
        debug!("sim runner: ({}) {}", channel, cmd);
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} {}", channel, cmd));
        Ok(RunnerReply {
            ok: self.ok.load(Ordering::Relaxed),
            latency_ms: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_runner_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim(), "miniMDock resume_gpu:7");
            let mut stream = stream;
            stream
                .write_all(b"{\"ok\":true,\"latency_ms\":12.0}\n")
                .unwrap();
        });

        let mut client = TcpRunnerClient::connect(&addr.to_string()).unwrap();
        let rep = client
            .request("miniMDock", &RunnerCommand::ResumeGpu { gpu: 7 })
            .unwrap();
        assert!(rep.ok);
        assert_eq!(rep.latency_ms, Some(12.0));
        server.join().unwrap();
    }

    #[test]
    fn test_sim_sink_records_wire_lines() {
        let mut sink = SimSink::new();
        let journal = sink.journal();
        sink.send(
            "miniMDock",
            &ResourceCommand::SetFreq {
                gpu: 1,
                freq_watts: 225,
            },
        )
        .unwrap();
        assert_eq!(journal.lock().unwrap().as_slice(), ["miniMDock SET_FREQ:1:225"]);
    }
}
