//! Example: decimate, interpolate and check the result
//!
//! Builds source -> keep-one-in-N -> repeat -> sink and runs it under the
//! chosen scheduler. Optionally swaps the repeat block for a fresh one while
//! the graph is running.
//!
//! Usage:
//!   cargo run --release --example rate_chain -- \
//!       --items 10000000 --keep 4 --repeat 3 --scheduler tpb
//!
//! Rewire half way and print the compiled graph:
//!   cargo run --release --example rate_chain -- --rewire --dump

use std::time::{Duration, Instant};

use clap::Parser;
use sigflow::blocks::{Head, KeepOneInN, MessageDebug, MessageStrobe, Repeat, VectorSink, VectorSource};
use sigflow::{BlockRef, RuntimeConfig, TagValue, TopBlock};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of items the source emits
    #[arg(short = 'n', long, default_value = "1000000")]
    items: u64,

    /// Keep one item in this many
    #[arg(short, long, default_value = "4")]
    keep: usize,

    /// Repeat each kept item this many times
    #[arg(short, long, default_value = "3")]
    repeat: usize,

    /// Scheduler: "tpb" (thread per block) or "sts" (single threaded)
    #[arg(short, long)]
    scheduler: Option<String>,

    /// Upper bound on items per work call
    #[arg(long)]
    max_noutput_items: Option<usize>,

    /// Replace the repeat block while running
    #[arg(long)]
    rewire: bool,

    /// Print a heartbeat message every this many milliseconds
    #[arg(long)]
    strobe_ms: Option<u64>,

    /// Print blocks, buffers and counters after the run
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("=== Rate Chain Example ===");
    let config = RuntimeConfig::default()
        .with_env_overrides()
        .with_scheduler_name(args.scheduler.as_deref());
    let tb = TopBlock::with_config("rate_chain", config);

    // A short ramp repeated forever, cut to length by head
    let pattern: Vec<u32> = (0..4096).collect();
    let src = BlockRef::new(VectorSource::new(pattern, true));
    let head = BlockRef::new(Head::new(4, args.items));
    let keep = BlockRef::new(KeepOneInN::new(4, args.keep));
    let repeat = BlockRef::new(Repeat::new(4, args.repeat));
    let sink = VectorSink::<u32>::new();
    let data = sink.data();
    let sink = BlockRef::new(sink);

    tb.connect(&src, 0, &head, 0)?;
    tb.connect(&head, 0, &keep, 0)?;
    tb.connect(&keep, 0, &repeat, 0)?;
    tb.connect(&repeat, 0, &sink, 0)?;

    if let Some(ms) = args.strobe_ms {
        let strobe = BlockRef::new(MessageStrobe::new(
            TagValue::from("heartbeat"),
            Duration::from_millis(ms),
        ));
        let debug = BlockRef::new(MessageDebug::new());
        tb.msg_connect(&strobe, "strobe", &debug, "print")?;
    }

    info!("Edges:\n{}", tb.edge_list()?);

    let started = Instant::now();
    tb.start(args.max_noutput_items)?;

    if args.rewire {
        std::thread::sleep(Duration::from_millis(5));
        tb.lock();
        let fresh = BlockRef::new(Repeat::new(4, args.repeat));
        tb.disconnect(&keep, 0, &repeat, 0)?;
        tb.disconnect(&repeat, 0, &sink, 0)?;
        tb.connect(&keep, 0, &fresh, 0)?;
        tb.connect(&fresh, 0, &sink, 0)?;
        tb.unlock()?;
        info!("Swapped {} for {}", repeat, fresh);
    }

    tb.wait();
    let elapsed = started.elapsed();

    let data = data.lock().unwrap_or_else(|e| e.into_inner());
    let expected = args.items / args.keep.max(1) as u64 * args.repeat as u64;
    info!(
        "Received {} items (expected {}) in {:.3}s",
        data.len(),
        expected,
        elapsed.as_secs_f64()
    );

    let in_order = data
        .chunks(args.repeat.max(1))
        .all(|c| c.iter().all(|&v| v == c[0]));
    if !in_order {
        info!("Output is not made of runs of {} equal items", args.repeat);
    }

    if args.dump {
        println!("{}", tb.dump());
    }

    Ok(())
}
