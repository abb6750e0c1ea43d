// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Regulation-signal playback.
//!
//! A regulation signal trace is a text file with one normalized sample
//! per line in [-1.0, 1.0]. The driver replays it in equal chunks, one
//! chunk per run, so a long trace can be split across benchmark
//! invocations.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug)]
pub struct RsSampler {
    samples: Vec<f64>,
}

impl RsSampler {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open RS trace {}", path.display()))?;
        let mut samples = Vec::new();
        for (nr, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed reading {}", path.display()))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let val: f64 = line.parse().with_context(|| {
                format!("{}:{}: not a regulation sample", path.display(), nr + 1)
            })?;
            samples.push(val);
        }
        if samples.is_empty() {
            bail!("RS trace {} has no samples", path.display());
        }
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// One of `num_chunks` equal slices of the trace. The trace length
    /// must divide evenly so every run replays the same amount of
    /// signal.
    pub fn chunk(&self, num_chunks: usize, ind: usize) -> Result<&[f64]> {
        if num_chunks == 0 || self.samples.len() % num_chunks != 0 {
            bail!(
                "{} samples cannot be split into {} equal chunks",
                self.samples.len(),
                num_chunks
            );
        }
        if ind >= num_chunks {
            bail!("Chunk index {} out of range, have {} chunks", ind, num_chunks);
        }
        let chunk_len = self.samples.len() / num_chunks;
        Ok(&self.samples[ind * chunk_len..(ind + 1) * chunk_len])
    }
}
