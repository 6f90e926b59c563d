use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use amtlv_agg::aggregator::Aggregator;
use amtlv_agg::config::AggConfig;
use amtlv_agg::kde::WeightedKde;
use amtlv_agg::processor::SampleProcessor;
use amtlv_agg::sample::{ClockIdentity, CorrectionField, PtpTimestamp, SyncData, TimeErrorSample};

#[derive(Parser, Debug)]
#[command(author, version, about = "Synthetic driver for a two-level AMTLV aggregation tree", long_about = None)]
struct Args {
    /// JSON configuration; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Devices below the leaf node
    #[arg(long, default_value_t = 8)]
    devices: u8,

    /// Stop after this many Sync intervals (0 = run until Ctrl+C)
    #[arg(long, default_value_t = 0)]
    rounds: u64,

    #[arg(long, default_value_t = 125)]
    interval_ms: u64,

    /// Mean device offset from the grandmaster
    #[arg(long, default_value_t = 0.0)]
    offset_ns: f64,

    #[arg(long, default_value_t = 50.0)]
    jitter_ns: f64,

    /// Probability that a device report is a gross outlier
    #[arg(long, default_value_t = 0.001)]
    outlier_rate: f64,

    /// Sync intervals between upstream transmissions
    #[arg(long, default_value_t = 16)]
    transmit_every: u64,

    /// Run as fast as possible instead of sleeping between intervals
    #[arg(long, default_value_t = false)]
    no_sleep: bool,
}

const GM: ClockIdentity = ClockIdentity([0x00, 0x1B, 0x19, 0xFF, 0xFE, 0x00, 0x00, 0x01]);
const LEAF: ClockIdentity = ClockIdentity([0x00, 0x1B, 0x19, 0xFF, 0xFE, 0x00, 0x00, 0x0A]);

fn device_id(n: u8) -> ClockIdentity {
    ClockIdentity([0x00, 0x1D, 0xC1, 0xFF, 0xFE, 0x00, 0x10, n])
}

fn gaussian(sigma: f64) -> f64 {
    let u1: f64 = 1.0 - rand::random::<f64>();
    let u2: f64 = rand::random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * sigma
}

/// Sync as a port would see it: origin timestamp, correction field and sender identity
/// decoded from their wire form, receipt time from the local clock.
fn sync(t1_ns: i64, t2_ns: i64, id: ClockIdentity) -> Result<SyncData> {
    let mut wire = Vec::with_capacity(PtpTimestamp::SIZE + 8 + ClockIdentity::SIZE);
    wire.extend_from_slice(&PtpTimestamp::from_nanos(t1_ns as i128).to_bytes());
    wire.extend_from_slice(&(CorrectionField::from_nanos(0).scaled() as i64).to_be_bytes());
    wire.extend_from_slice(id.as_bytes());

    let (origin, rest) = wire.split_at(PtpTimestamp::SIZE);
    let (correction, sender) = rest.split_at(8);
    Ok(SyncData::new(
        PtpTimestamp::parse(origin)?,
        PtpTimestamp::from_nanos(t2_ns as i128),
        CorrectionField::from_bytes(correction)?,
        ClockIdentity::from_slice(sender)?,
    ))
}

struct SimNode {
    processor: Arc<SampleProcessor>,
    aggregator: Aggregator<WeightedKde>,
}

impl SimNode {
    fn new(config: &AggConfig) -> Result<Self> {
        let processor = Arc::new(SampleProcessor::offset());
        let aggregator = Aggregator::from_config(processor.clone(), config)?;
        Ok(SimNode { processor, aggregator })
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AggConfig::from_json_file(path)?,
        None => AggConfig::default(),
    };
    if config.model.dimensions != 1 {
        anyhow::bail!("amtlvsim only drives the 1-dimensional offset metric");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let leaf = SimNode::new(&config).context("Failed to build leaf aggregator")?;
    let mut root_config = config.clone();
    root_config.aggregator.monitoring_ports = 1;
    let root = SimNode::new(&root_config).context("Failed to build root aggregator")?;

    leaf.aggregator.register_outlier_receipt_callback(Arc::new(|sample: &TimeErrorSample| {
        warn!("[Leaf] Outlier from {}: {:.1}ns", sample.clock_identity(), sample.values()[0]);
    }));

    info!(
        "Simulating {} devices at {:.1}ns +/- {:.1}ns below one leaf (window {} x {} ports)",
        args.devices, args.offset_ns, args.jitter_ns, config.model.window_size, config.aggregator.monitoring_ports
    );

    let interval_ns = (args.interval_ms as i64) * 1_000_000;
    let max_frame = config.aggregator.max_frame_size;
    let mut round: u64 = 0;
    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) && (args.rounds == 0 || round < args.rounds) {
        let t = round as i64 * interval_ns;
        leaf.processor.received_gm_sync(sync(t, t, GM)?, 0.0, GM);
        root.processor.received_gm_sync(sync(t, t, GM)?, 0.0, GM);

        for n in 0..args.devices {
            let mut offset = args.offset_ns + gaussian(args.jitter_ns);
            if rand::random::<f64>() < args.outlier_rate {
                offset += 1_000.0 * args.jitter_ns.max(1.0);
            }
            let rev = sync(t + offset.round() as i64, t, device_id(n))?;
            leaf.processor.received_reverse_sync(&rev, 0.0, true);
        }

        if round % args.transmit_every.max(1) == 0 {
            match leaf.aggregator.retrieve_new_data(max_frame) {
                Ok(frames) => {
                    for frame in frames {
                        let rev = sync(t, t, LEAF)?.with_amtlv(frame);
                        root.processor.received_reverse_sync(&rev, 0.0, true);
                    }
                }
                Err(e) => error!("[Leaf] Failed to build AMTLV: {}", e),
            }
            match root.aggregator.retrieve_new_data(max_frame) {
                Ok(frames) => {
                    let bytes: usize = frames.iter().map(|f| f.len()).sum();
                    info!("[Root] Upstream: {} frames, {} bytes", frames.len(), bytes);
                }
                Err(e) => error!("[Root] Failed to build AMTLV: {}", e),
            }
        }

        if last_log.elapsed() >= Duration::from_secs(10) {
            let leaf_model = leaf.aggregator.model();
            info!(
                "[Leaf] window {}/{} mean {:?} sd {:?} | [Root] represents {} devices",
                leaf_model.window_len(),
                leaf_model.local_window_size(),
                leaf_model.mean(),
                leaf_model.standard_deviation(),
                root.processor.network_representation() + root.aggregator.monitoring_ports() as u64
            );
            last_log = Instant::now();
        }

        round += 1;
        if !args.no_sleep {
            thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }

    leaf.aggregator.stop_aggregation();
    root.aggregator.stop_aggregation();
    info!("Exiting after {} rounds.", round);
    Ok(())
}
