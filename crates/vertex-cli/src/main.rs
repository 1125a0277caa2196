// SPDX-License-Identifier: AGPL-3.0-only

//! `vertex` — command-line front end for the vertex driver.
//!
//! ```text
//! USAGE:
//!   vertex run [--graphs N] [--frames M] [--priorities P,..]   Simulated workload
//!   vertex formats                                             Pixel format table
//!   vertex config                                              Effective configuration
//!   vertex mailbox                                             Ring layout
//! ```
//!
//! Configuration comes from `VERTEX_*` environment variables (see
//! `VertexConfig::from_env`), logging from `RUST_LOG`.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vertex_driver::chip::{limits, status, HEADER_SIZE, MESSAGE_SIZE, PAYLOAD_SIZE};
use vertex_driver::format::{codes, FORMATS};
use vertex_driver::prelude::*;
use vertex_driver::task::TimePoint;
use vertex_driver::{GraphStats, Mailbox};

#[derive(Parser)]
#[command(name = "vertex", about = "Vertex compute-graph driver CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Stream frames through several graphs on the simulated firmware.
    Run {
        /// Number of concurrent graphs.
        #[arg(long, default_value_t = 2)]
        graphs: usize,
        /// Frames per graph.
        #[arg(long, default_value_t = 64)]
        frames: u32,
        /// Per-graph priorities, comma separated (missing entries use the default).
        #[arg(long, value_delimiter = ',')]
        priorities: Vec<u32>,
        /// Bundles kept in flight per graph.
        #[arg(long, default_value_t = 4)]
        depth: u32,
        /// Simulated firmware time per invoke, in microseconds.
        #[arg(long, default_value_t = 200)]
        latency_us: u64,
        /// Fail this many invokes in firmware.
        #[arg(long, default_value_t = 0)]
        fail: u32,
        /// Frame width in pixels.
        #[arg(long, default_value_t = 320)]
        width: u32,
        /// Frame height in pixels.
        #[arg(long, default_value_t = 240)]
        height: u32,
    },
    /// List the pixel formats the engine accepts.
    Formats,
    /// Print the effective driver configuration.
    Config,
    /// Print the mailbox ring layout.
    Mailbox,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Run {
            graphs,
            frames,
            priorities,
            depth,
            latency_us,
            fail,
            width,
            height,
        } => cmd_run(&Workload {
            graphs,
            frames,
            priorities,
            depth,
            latency: Duration::from_micros(latency_us),
            fail,
            width,
            height,
        })?,
        Cmd::Formats => cmd_formats(),
        Cmd::Config => cmd_config(),
        Cmd::Mailbox => cmd_mailbox()?,
    }

    Ok(())
}

const QBUF_RETRIES: u32 = 1000;

struct Workload {
    graphs: usize,
    frames: u32,
    priorities: Vec<u32>,
    depth: u32,
    latency: Duration,
    fail: u32,
    width: u32,
    height: u32,
}

struct GraphReport {
    stats: GraphStats,
    frames: u32,
    invalid: u32,
    latencies: Vec<Duration>,
    exec_us: u64,
}

fn cmd_run(work: &Workload) -> Result<()> {
    let firmware = FirmwareConfig::default()
        .with_invoke_latency(work.latency)
        .with_invoke_failures(work.fail, status::INTERNAL);
    let device = VertexDevice::open(VertexConfig::from_env(), &firmware)?;
    tracing::info!("Running {} graph(s) × {} frame(s)", work.graphs, work.frames);

    let started = Instant::now();
    let reports: Vec<Result<GraphReport>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..work.graphs)
            .map(|n| {
                let priority = work
                    .priorities
                    .get(n)
                    .copied()
                    .unwrap_or(limits::DEFAULT_PRIORITY);
                let device = &device;
                s.spawn(move || run_graph(device, work, n, priority))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| Err(anyhow!("graph worker panicked"))))
            .collect()
    });
    let elapsed = started.elapsed();

    println!(
        "{:>5} {:>4} {:>7} {:>7} {:>10} {:>10} {:>9}",
        "graph", "prio", "frames", "invalid", "mean µs", "max µs", "exec µs"
    );
    let mut total = 0u64;
    for report in reports {
        let r = report?;
        total += u64::from(r.frames);
        let max = r.latencies.iter().max().copied().unwrap_or_default();
        println!(
            "{:>5} {:>4} {:>7} {:>7} {:>10.1} {:>10} {:>9}",
            r.stats.id,
            r.stats.priority,
            r.frames,
            r.invalid,
            mean_us(&r.latencies),
            max.as_micros(),
            r.exec_us / u64::from(r.frames.max(1)),
        );
        println!(
            "      done={} cancel={} failed={}",
            r.stats.done, r.stats.cancel, r.stats.failed
        );
    }

    let sched = device.graph_manager().stats();
    let itf = device.interface().stats();
    println!();
    println!(
        "{total} frame(s) in {:.1} ms ({:.0} frames/s)",
        elapsed.as_secs_f64() * 1e3,
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "Scheduler  dispatched={} completed={} canceled={} stale={}",
        sched.dispatched, sched.completed, sched.canceled, sched.stale
    );
    println!(
        "Interface  commands={} invokes={} replies={} timeouts={} stale={}",
        itf.commands, itf.invokes, itf.replies, itf.timeouts, itf.stale
    );

    device.close()?;
    Ok(())
}

fn run_graph(device: &VertexDevice, work: &Workload, n: usize, priority: u32) -> Result<GraphReport> {
    let ctx = device.open_context()?;
    ctx.set_graph(priority, 0)?;
    let spec = FormatSpec {
        target: 0,
        format: codes::NV12,
        planes: 2,
        width: work.width,
        height: work.height,
    };
    ctx.set_format(Direction::Input, &[spec])?;
    ctx.set_format(Direction::Output, &[FormatSpec { format: codes::U8, planes: 1, ..spec }])?;
    ctx.streamon()?;

    let depth = work.depth.clamp(1, u32::try_from(limits::MAX_BUNDLES)?);
    let base = i32::try_from(n * 64).context("too many graphs")?;
    let mut report = GraphReport {
        stats: ctx.stats(),
        frames: work.frames,
        invalid: 0,
        latencies: Vec::with_capacity(work.frames as usize),
        exec_us: 0,
    };

    for frame in 0..work.frames {
        if frame >= depth {
            collect(&ctx, &mut report)?;
        }
        let slot = frame % depth;
        let handle = base + 4 * i32::try_from(slot)?;
        ctx.qbuf(Direction::Input, submit(frame, slot, &[handle, handle + 1]))?;
        qbuf_retrying(&ctx, submit(frame, slot, &[handle + 2]))?;
    }
    for _ in 0..work.frames.min(depth) {
        collect(&ctx, &mut report)?;
    }

    ctx.streamoff()?;
    report.stats = ctx.stats();
    ctx.close()?;
    Ok(report)
}

/// The output side triggers pairing, which fails with a retryable error
/// while the scheduler has no free descriptor
fn qbuf_retrying(ctx: &VertexContext, output: BundleSubmit) -> Result<()> {
    for _ in 0..QBUF_RETRIES {
        match ctx.qbuf(Direction::Output, output.clone()) {
            Err(e) if e.is_retryable() => std::thread::sleep(Duration::from_millis(1)),
            other => return other.map_err(Into::into),
        }
    }
    Err(anyhow!("graph {}: scheduler stayed full", ctx.id()))
}

fn submit(id: u32, index: u32, handles: &[i32]) -> BundleSubmit {
    BundleSubmit {
        id,
        index,
        containers: vec![ContainerDesc {
            target: 0,
            buffers: handles
                .iter()
                .map(|&h| BufferDesc {
                    handle: MemHandle(h),
                    roi: Roi::default(),
                })
                .collect(),
        }],
    }
}

fn collect(ctx: &VertexContext, report: &mut GraphReport) -> Result<()> {
    let out = ctx.dqbuf(Direction::Output)?;
    ctx.dqbuf(Direction::Input)?;
    if out.flags & bundle_flags::INVALID != 0 {
        report.invalid += 1;
    }
    let ts = out.timestamps;
    if let (Some(queued), Some(done)) = (ts[TimePoint::Queue as usize], ts[TimePoint::Done as usize]) {
        report.latencies.push(done.duration_since(queued));
    }
    report.exec_us += out.exec_us;
    Ok(())
}

fn mean_us(latencies: &[Duration]) -> f64 {
    if latencies.is_empty() {
        return 0.0;
    }
    let sum: Duration = latencies.iter().sum();
    sum.as_secs_f64() * 1e6 / latencies.len() as f64
}

fn cmd_formats() {
    println!("{:<6} {:<26} {:>6}  bits/pixel", "code", "name", "planes");
    for f in &FORMATS {
        let fourcc: String = f.code.to_le_bytes().iter().map(|&b| char::from(b)).collect();
        let bits = &f.bits_per_pixel[..f.planes as usize];
        println!("{fourcc:<6} {:<26} {:>6}  {bits:?}", f.name, f.planes);
    }
}

fn cmd_config() {
    let c = VertexConfig::from_env();
    println!("Graph slots         : {}", c.max_graphs);
    println!("Tasks per graph     : {} (index 0 reserved)", c.graph_tasks);
    println!("Interface tasks     : {}", c.interface_tasks);
    println!("Task descriptors    : {}", c.max_descriptors);
    println!("Bundles / direction : {}", c.max_bundles);
    println!(
        "Mailbox rings       : normal {} / urgent {}",
        c.mailbox.normal_capacity, c.mailbox.urgent_capacity
    );
    println!(
        "Mailbox busy-poll   : {} × {:?} (budget {:?})",
        c.mailbox_poll.retries,
        c.mailbox_poll.interval,
        c.mailbox_poll.budget()
    );
    println!("Command timeout     : {:?}", c.command_timeout);
    println!("Invoke timeout      : {:?}", c.invoke_timeout);
    println!("Reply poll interval : {:?}", c.reply_poll_interval);
    println!("Dequeue timeout     : {:?}", c.dequeue_timeout);
    println!(
        "Stop drain          : {} × {:?} (budget {:?})",
        c.stop_poll.retries,
        c.stop_poll.interval,
        c.stop_poll.budget()
    );
    println!("Event queue depth   : {}", c.event_queue_depth);
}

fn cmd_mailbox() -> Result<()> {
    let config = VertexConfig::from_env();
    let mailbox = Mailbox::new(&config.mailbox)?;
    println!("Message : {MESSAGE_SIZE} bytes ({HEADER_SIZE} header + {PAYLOAD_SIZE} payload)");
    println!();
    println!("{:<11} {:>5} {:>8}", "ring", "slots", "bytes");
    for ring in mailbox.snapshot() {
        println!(
            "{:<11} {:>5} {:>8}",
            ring.id.to_string(),
            ring.capacity,
            ring.capacity as usize * MESSAGE_SIZE
        );
    }
    Ok(())
}
