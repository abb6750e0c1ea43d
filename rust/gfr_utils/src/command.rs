// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Wire commands exchanged with the remote agents.
//!
//! Both command families travel as colon-separated strings on a
//! per-application channel. They are kept as tagged variants here and
//! serialized/parsed at the transport edge, so the remote side can
//! decode with an exhaustive match instead of splitting strings by
//! hand.

use anyhow::anyhow;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;
use std::fmt;
use std::str::FromStr;

/// Commands consumed by the resource agent (fire-and-forget).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceCommand {
    /// `SET_CUMASK:<gpu>:<maskLowHex8>:<maskHighHex8>`
    SetCuMask {
        gpu: u32,
        mask_low: String,
        mask_high: String,
    },
    /// `SET_FREQ:<gpu>:<freqWatts>`
    SetFreq { gpu: u32, freq_watts: u32 },
}

impl fmt::Display for ResourceCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SetCuMask {
                gpu,
                mask_low,
                mask_high,
            } => write!(f, "SET_CUMASK:{}:{}:{}", gpu, mask_low, mask_high),
            Self::SetFreq { gpu, freq_watts } => write!(f, "SET_FREQ:{}:{}", gpu, freq_watts),
        }
    }
}

impl FromStr for ResourceCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok((gpu, mask_low, mask_high)) = sscanf!(s, "SET_CUMASK:{u32}:{String}:{String}") {
            return Ok(Self::SetCuMask {
                gpu,
                mask_low,
                mask_high,
            });
        }
        if let Ok((gpu, freq_watts)) = sscanf!(s, "SET_FREQ:{u32}:{u32}") {
            return Ok(Self::SetFreq { gpu, freq_watts });
        }
        Err(anyhow!("Unrecognized resource command: {}", s))
    }
}

/// Commands consumed by the workload runner (request -> reply).
///
/// The BE runner is keyed by GPU alone; the LC runner additionally
/// carries the served model, and on `add_gpu` the batch size.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunnerCommand {
    /// `start:`
    Start,
    /// `add_gpu:<gpu>`
    AddGpu { gpu: u32 },
    /// `pause_gpu:<gpu>`
    PauseGpu { gpu: u32 },
    /// `resume_gpu:<gpu>`
    ResumeGpu { gpu: u32 },
    /// `add_gpu:<model>:<gpu>:<batch>`
    AddLcGpu {
        model: String,
        gpu: u32,
        batch_size: u32,
    },
    /// `pause_gpu:<model>:<gpu>`
    PauseLcGpu { model: String, gpu: u32 },
    /// `resume_gpu:<model>:<gpu>`
    ResumeLcGpu { model: String, gpu: u32 },
    /// `stop:`
    Stop,
}

impl fmt::Display for RunnerCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start:"),
            Self::AddGpu { gpu } => write!(f, "add_gpu:{}", gpu),
            Self::PauseGpu { gpu } => write!(f, "pause_gpu:{}", gpu),
            Self::ResumeGpu { gpu } => write!(f, "resume_gpu:{}", gpu),
            Self::AddLcGpu {
                model,
                gpu,
                batch_size,
            } => write!(f, "add_gpu:{}:{}:{}", model, gpu, batch_size),
            Self::PauseLcGpu { model, gpu } => write!(f, "pause_gpu:{}:{}", model, gpu),
            Self::ResumeLcGpu { model, gpu } => write!(f, "resume_gpu:{}:{}", model, gpu),
            Self::Stop => write!(f, "stop:"),
        }
    }
}

impl FromStr for RunnerCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start:" => return Ok(Self::Start),
            "stop:" => return Ok(Self::Stop),
            _ => {}
        }
        if let Ok(gpu) = sscanf!(s, "add_gpu:{u32}") {
            return Ok(Self::AddGpu { gpu });
        }
        if let Ok(gpu) = sscanf!(s, "pause_gpu:{u32}") {
            return Ok(Self::PauseGpu { gpu });
        }
        if let Ok(gpu) = sscanf!(s, "resume_gpu:{u32}") {
            return Ok(Self::ResumeGpu { gpu });
        }
        if let Ok((model, gpu, batch_size)) = sscanf!(s, "add_gpu:{String}:{u32}:{u32}") {
            return Ok(Self::AddLcGpu {
                model,
                gpu,
                batch_size,
            });
        }
        if let Ok((model, gpu)) = sscanf!(s, "pause_gpu:{String}:{u32}") {
            return Ok(Self::PauseLcGpu { model, gpu });
        }
        if let Ok((model, gpu)) = sscanf!(s, "resume_gpu:{String}:{u32}") {
            return Ok(Self::ResumeLcGpu { model, gpu });
        }
        Err(anyhow!("Unrecognized runner command: {}", s))
    }
}

/// Reply line from the workload runner.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RunnerReply {
    pub ok: bool,
    /// Observed QoS latency in milliseconds, when the runner reports one.
    #[serde(default)]
    pub latency_ms: Option<f64>,
}
