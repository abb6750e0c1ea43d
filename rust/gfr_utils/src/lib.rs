// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared types for the GPU frequency-regulation power-cap controller:
//! CU masks, wire commands, and the externally supplied power-model data.

pub mod command;
pub mod cumask;
pub mod powermodel;

pub use command::ResourceCommand;
pub use command::RunnerCommand;
pub use command::RunnerReply;
pub use cumask::CuMask;
pub use powermodel::CapRange;
pub use powermodel::PowerModel;
pub use powermodel::RegulationPlan;

/// Number of maskable compute units per GPU (MI50).
pub const MAX_CUS: u32 = 60;

/// Shader engines per GPU; CUs are interleaved across them.
pub const NR_SHADER_ENGINES: u32 = 4;

/// CUs per shader engine.
pub const CUS_PER_SHADER_ENGINE: u32 = MAX_CUS / NR_SHADER_ENGINES;

/// Hardware-supported power-cap range in watts.
pub const CAP_MIN_WATTS: u32 = 5;
pub const CAP_MAX_WATTS: u32 = 225;
