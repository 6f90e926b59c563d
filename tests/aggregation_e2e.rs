use anyhow::Result;
use amtlv_agg::aggregator::Aggregator;
use amtlv_agg::config::AggConfig;
use amtlv_agg::kde::WeightedKde;
use amtlv_agg::model::ResamplePolicy;
use amtlv_agg::processor::SampleProcessor;
use amtlv_agg::sample::{ClockIdentity, CorrectionField, PtpTimestamp, SyncData, TimeErrorSample};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// --- Simulated Tree ---

const GM: ClockIdentity = ClockIdentity([0x00, 0x1B, 0x19, 0xFF, 0xFE, 0x00, 0x00, 0x01]);
const SYNC_INTERVAL_NS: i64 = 125_000_000;

fn device(n: u8) -> ClockIdentity {
    ClockIdentity([0x00, 0x1D, 0xC1, 0xFF, 0xFE, 0x00, 0x10, n])
}

fn jitter(sigma_ns: f64) -> f64 {
    // Box-Muller Noise
    let u1: f64 = 1.0 - rand::random::<f64>();
    let u2: f64 = rand::random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * sigma_ns
}

fn sync(t1_ns: i64, t2_ns: i64, id: ClockIdentity) -> SyncData {
    SyncData::new(
        PtpTimestamp::from_nanos(t1_ns as i128),
        PtpTimestamp::from_nanos(t2_ns as i128),
        CorrectionField::from_nanos(0),
        id,
    )
}

struct Node {
    id: ClockIdentity,
    processor: Arc<SampleProcessor>,
    aggregator: Aggregator<WeightedKde>,
    max_frame_size: usize,
}

impl Node {
    fn new(id: ClockIdentity, config: &AggConfig) -> Result<Self> {
        let processor = Arc::new(SampleProcessor::offset());
        let aggregator = Aggregator::from_config(processor.clone(), config)?;
        Ok(Node {
            id,
            processor,
            aggregator,
            max_frame_size: config.aggregator.max_frame_size,
        })
    }

    fn gm_sync(&self, t_ns: i64) {
        self.processor.received_gm_sync(sync(t_ns, t_ns, GM), 0.0, GM);
    }

    /// Reverse Sync from a downstream device whose clock is `offset_ns` ahead of the GM.
    fn device_report(&self, id: ClockIdentity, t_ns: i64, offset_ns: f64) {
        let t1 = t_ns + offset_ns.round() as i64;
        self.processor.received_reverse_sync(&sync(t1, t_ns, id), 0.0, true);
    }

    /// Retrieve this node's AMTLV frames and deliver each on its own reverse Sync to `parent`.
    fn send_upstream(&self, parent: &Node, t_ns: i64) -> Result<Vec<Vec<u8>>> {
        let frames = self.aggregator.retrieve_new_data(self.max_frame_size)?;
        for frame in &frames {
            let rev = sync(t_ns, t_ns, self.id).with_amtlv(frame.clone());
            parent.processor.received_reverse_sync(&rev, 0.0, false);
        }
        Ok(frames)
    }
}

fn leaf_config(ports: usize) -> AggConfig {
    let mut config = AggConfig::default();
    config.model.window_size = 20;
    config.aggregator.monitoring_ports = ports;
    config.aggregator.network_window_size = 10;
    config
}

/// Two devices per round at N(mean, sigma) feeding `leaf`.
fn run_rounds(leaf: &Node, start_round: i64, rounds: i64, mean_ns: f64, sigma_ns: f64) {
    for r in start_round..start_round + rounds {
        let t = r * SYNC_INTERVAL_NS;
        leaf.gm_sync(t);
        leaf.device_report(device(1), t, mean_ns + jitter(sigma_ns));
        leaf.device_report(device(2), t, mean_ns + jitter(sigma_ns));
    }
}

// --- The Test Runner ---

#[test]
fn test_leaf_summary_reaches_parent() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let leaf = Node::new(device(0xA0), &leaf_config(2))?;
    let parent = Node::new(device(0xB0), &leaf_config(1))?;

    let mut summaries = 0;
    for block in 0..20 {
        run_rounds(&leaf, block * 10, 10, 100.0, 5.0);
        parent.gm_sync(block * 10 * SYNC_INTERVAL_NS);
        for frame in leaf.send_upstream(&parent, block * 10 * SYNC_INTERVAL_NS)? {
            assert!(frame.len() <= leaf.max_frame_size);
            if u16::from_be_bytes([frame[4], frame[5]]) > 0 {
                summaries += 1;
            }
        }
    }

    println!("Leaf summaries carrying samples: {}", summaries);
    assert!(summaries >= 5, "only {} summaries", summaries);

    // leaf weight = its 2 ports; nothing below it reports
    assert_eq!(parent.processor.network_representation(), 2);

    let mean = parent.aggregator.model().mean().expect("parent model fitted")[0];
    println!("Parent view of subtree mean: {:.2}ns", mean);
    assert!((mean - 100.0).abs() < 10.0, "mean {}", mean);
    Ok(())
}

#[test]
fn test_outlier_propagates_to_parent() -> Result<()> {
    let leaf = Node::new(device(0xA0), &leaf_config(2))?;
    let parent = Node::new(device(0xB0), &leaf_config(1))?;

    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let rogue = device(0x66);
    leaf.aggregator.register_outlier_receipt_callback(Arc::new(move |sample: &TimeErrorSample| {
        if sample.clock_identity() == rogue {
            s.fetch_add(1, Ordering::SeqCst);
        }
    }));

    run_rounds(&leaf, 0, 50, 100.0, 5.0);
    let t = 50 * SYNC_INTERVAL_NS;
    leaf.gm_sync(t);
    leaf.device_report(rogue, t, 100_000.0);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    parent.gm_sync(t);
    leaf.send_upstream(&parent, t)?;
    parent.send_upstream(&Node::new(device(0xC0), &leaf_config(1))?, t)?;

    let forwarded = parent.aggregator.last_transmitted().expect("parent transmitted");
    let hit = forwarded
        .outliers()
        .iter()
        .find(|o| o.clock_identity() == rogue)
        .expect("rogue device forwarded by parent");
    assert_eq!(hit.values(), &[100_000.0]);
    Ok(())
}

#[test]
fn test_segmented_outliers_all_arrive() -> Result<()> {
    let mut config = leaf_config(2);
    config.aggregator.max_frame_size = 64;
    let leaf = Node::new(device(0xA0), &config)?;
    let parent = Node::new(device(0xB0), &leaf_config(1))?;

    run_rounds(&leaf, 0, 30, -40.0, 3.0);
    let t = 30 * SYNC_INTERVAL_NS;
    leaf.gm_sync(t);
    for n in 0..10u8 {
        let sign = if n % 2 == 0 { 1.0 } else { -1.0 };
        leaf.device_report(device(0x70 + n), t, sign * (n as f64 + 1.0) * 100_000.0);
    }
    assert_eq!(leaf.aggregator.pending_outliers(), 10);

    parent.gm_sync(t);
    let frames = leaf.send_upstream(&parent, t)?;
    // 8-byte header + 3 outliers of 16 bytes fit in 64
    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|f| f.len() <= 64));

    // parent has no density yet, so every outlier is passed through
    assert_eq!(parent.aggregator.pending_outliers(), 10);
    assert_eq!(parent.processor.network_representation(), 2);
    Ok(())
}

#[test]
fn test_divergence_policy_suppresses_stable_summaries() -> Result<()> {
    let mut config = leaf_config(2);
    config.model.resample_policy = ResamplePolicy::Divergence { threshold: 0.5, base_unit: vec![1.0] };
    let leaf = Node::new(device(0xA0), &config)?;
    let parent = Node::new(device(0xB0), &leaf_config(1))?;

    let count_summaries = |start: i64, blocks: i64, mean: f64| -> Result<usize> {
        let mut n = 0;
        for block in start..start + blocks {
            run_rounds(&leaf, block * 10, 10, mean, 5.0);
            for frame in leaf.send_upstream(&parent, block * 10 * SYNC_INTERVAL_NS)? {
                if u16::from_be_bytes([frame[4], frame[5]]) > 0 {
                    n += 1;
                }
            }
        }
        Ok(n)
    };

    let stable = count_summaries(0, 12, 100.0)?;
    assert_eq!(stable, 1, "stable network should be summarized once");

    let shifted = count_summaries(12, 6, 1100.0)?;
    assert!(shifted >= 1, "shifted distribution not re-summarized");
    Ok(())
}
