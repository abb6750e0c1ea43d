// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod controller;
use controller::ControllerConfig;
use controller::PowerController;

mod resource;
use resource::AllocPolicy;
use resource::GpuResourceManager;

mod signal;
use signal::RsSampler;

mod state;
mod stats;

mod telemetry;
use telemetry::PowerCollector;

mod wire;
use wire::CommandSink;
use wire::RunnerClient;
use wire::SimRunner;
use wire::SimSink;
use wire::TcpCommandSink;
use wire::TcpRunnerClient;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use gfr_utils::PowerModel;
use gfr_utils::RegulationPlan;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;

/// gfr_cap: GPU power-budget allocation for frequency-regulation markets
///
/// Drives a node of colocated GPU workloads so that its total power draw
/// tracks a grid regulation signal. A latency-critical inference server
/// keeps its share of compute units; a best-effort batch workload absorbs
/// the power swings by having its GPUs capped, paused, and resumed.
///
/// Each tick (2s by default) takes one sample from the regulation-signal
/// trace, converts it into a target wattage via the regulation plan, and
/// greedily moves the best-effort footprint toward that target. Per-GPU
/// caps come from an offline power model mapping a CU allocation tier to
/// its supported cap range.
///
/// Compute-unit masks and power caps are sent to a resource agent on the
/// node; workload lifecycle commands go to the workload runner; realized
/// power is read from a telemetry publisher. With --simulate all three
/// are replaced by in-process stand-ins and the realized power is the sum
/// of the caps the controller believes it has set.
#[derive(Debug, Parser)]
struct Opts {
    /// Path to the power model JSON mapping CU tiers to cap ranges.
    #[clap(short = 'm', long)]
    power_model: PathBuf,

    /// Path to the regulation plan JSON (fr_power and committed ranges).
    #[clap(short = 'p', long)]
    regulation_plan: PathBuf,

    /// Path to the regulation-signal trace, one sample in [-1, 1] per line.
    #[clap(short = 't', long)]
    rs_trace: PathBuf,

    /// Number of equal chunks the trace is split into.
    #[clap(long, default_value = "15")]
    num_chunks: usize,

    /// Which chunk of the trace to replay in this run.
    #[clap(short = 'k', long, default_value = "0")]
    chunk_index: usize,

    /// Number of GPUs on the node.
    #[clap(short = 'g', long, default_value = "8")]
    nr_gpus: u32,

    /// CU allocation policy.
    #[clap(long, value_enum, default_value_t = AllocPolicy::Simple)]
    policy: AllocPolicy,

    /// Average LC load as a percentage of the node, sets how many GPUs
    /// the inference server keeps active.
    #[clap(short = 'L', long, default_value = "60")]
    lc_load: u32,

    /// Channel name of the best-effort workload.
    #[clap(long, default_value = "miniMDock")]
    be_app: String,

    /// Channel name of the latency-critical workload.
    #[clap(long, default_value = "Inference-Server")]
    lc_app: String,

    /// Model served by the latency-critical workload.
    #[clap(long, default_value = "resnet152")]
    lc_model: String,

    /// Inference batch size of the latency-critical workload.
    #[clap(long, default_value = "1")]
    lc_batch_size: u32,

    /// Resource agent address for CU masks and power caps.
    #[clap(long, default_value = "127.0.0.1:5555")]
    resource_addr: String,

    /// Workload runner address for lifecycle commands.
    #[clap(long, default_value = "127.0.0.1:5556")]
    runner_addr: String,

    /// Power telemetry publisher address.
    #[clap(long, default_value = "127.0.0.1:5560")]
    power_addr: String,

    /// Control tick interval in seconds.
    #[clap(short = 'i', long, default_value = "2.0")]
    interval: f64,

    /// Idle draw per GPU in watts, subtracted from telemetry when the
    /// regulation plan carries no measured baseline.
    #[clap(long, default_value = "16.0")]
    idle_watts_per_gpu: f64,

    /// The committed ranges are symmetric: pick reg_up or reg_down by
    /// the sign of the signal instead of scaling reg_down both ways.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    symmetric_range: bool,

    /// Run against in-process stand-ins instead of live agents.
    #[clap(short = 's', long, action = clap::ArgAction::SetTrue)]
    simulate: bool,

    /// Enable the Prometheus endpoint for metrics.
    #[clap(short = 'e', long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,

    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Driver {
    controller: PowerController,
    plan: RegulationPlan,
    collector: Option<PowerCollector>,
    baseline_watts: f64,
    symmetric_range: bool,
    simulate: bool,
    interval: Duration,
}

impl Driver {
    fn init(opts: &Opts) -> Result<Self> {
        let model = PowerModel::load(&opts.power_model)?;
        let plan = RegulationPlan::load(&opts.regulation_plan)?;
        let envelope = model.envelope()?;
        info!(
            "Power model: {}W..{}W per GPU, plan fr_power {:.0}W",
            envelope.min_supported, envelope.max_supported, plan.fr_power
        );

        let (sink, runner): (Box<dyn CommandSink>, Box<dyn RunnerClient>) = if opts.simulate {
            (Box::new(SimSink::new()), Box::new(SimRunner::new()))
        } else {
            (
                Box::new(TcpCommandSink::connect(&opts.resource_addr)?),
                Box::new(TcpRunnerClient::connect(&opts.runner_addr)?),
            )
        };
        let collector = if opts.simulate {
            None
        } else {
            Some(PowerCollector::connect(&opts.power_addr)?)
        };

        let baseline_watts = if plan.baseline_power > 0.0 {
            plan.baseline_power
        } else {
            opts.idle_watts_per_gpu * opts.nr_gpus as f64
        };

        let resources = GpuResourceManager::new(opts.nr_gpus, opts.policy, sink);
        let mut controller = PowerController::new(
            ControllerConfig {
                nr_gpus: opts.nr_gpus,
                be_app: opts.be_app.clone(),
                lc_app: opts.lc_app.clone(),
                lc_model: opts.lc_model.clone(),
                lc_batch_size: opts.lc_batch_size,
            },
            envelope,
            resources,
            runner,
        );
        controller.setup(opts.lc_load)?;

        Ok(Self {
            controller,
            plan,
            collector,
            baseline_watts,
            symmetric_range: opts.symmetric_range,
            simulate: opts.simulate,
            interval: Duration::from_secs_f64(opts.interval),
        })
    }

    fn current_power(&self) -> f64 {
        if self.simulate {
            return self.controller.internal_power() as f64;
        }
        let meter = self
            .collector
            .as_ref()
            .and_then(|collector| collector.latest());
        match meter {
            Some(sample) => (sample.total_watts - self.baseline_watts).max(0.0),
            None => {
                warn!("No telemetry yet, falling back to the internal estimate");
                self.controller.internal_power() as f64
            }
        }
    }

    fn run(&mut self, chunk: &[f64], shutdown: Arc<AtomicBool>) -> Result<()> {
        for (step, &rs_val) in chunk.iter().enumerate() {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let target = self.plan.target_power(rs_val, self.symmetric_range);
            let current = self.current_power();
            let elapsed = self.controller.tick(target, current);
            info!(
                "step {:>4}: rs {:+.3} target {:>6.0}W current {:>6.0}W internal {:>5}W depth {} ({:?})",
                step,
                rs_val,
                target,
                current,
                self.controller.internal_power(),
                self.controller.stack_depth(),
                elapsed,
            );
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.controller.shutdown();
        Ok(())
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("failed to install Prometheus recorder")?;
    }

    let sampler = RsSampler::load(&opts.rs_trace)?;
    let chunk = sampler.chunk(opts.num_chunks, opts.chunk_index)?;
    info!(
        "Replaying chunk {}/{} of the RS trace: {} samples at {:.1}s",
        opts.chunk_index, opts.num_chunks, chunk.len(), opts.interval
    );

    let mut driver = Driver::init(&opts)?;
    driver.run(chunk, shutdown)
}
