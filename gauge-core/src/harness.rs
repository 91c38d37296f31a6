//! Measurement core
//!
//! Per combination the harness walks a fixed sequence: reset counters,
//! measure peak memory (with its own warmup inside the tracking scope),
//! reset counters again, warm up, measure latency, derive the reported
//! figures. A combination either completes the whole sequence or aborts;
//! there are no partial results.

use anyhow::{bail, Result};
use std::time::Instant;
use tracing::{debug, info};

use crate::device::DeviceSession;
use crate::generate::Workload;
use crate::memory::{derive_peak_memory, AllocatorCounters, MemoryPeaks, MemoryTracker};

/// Immutable configuration of one combination.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub batch_size: usize,
    pub prompt_length: usize,
    pub new_tokens: usize,
    /// Number of timed repetitions.
    pub num_batches: usize,
}

/// Raw latency samples for one combination, in milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    samples_ms: Vec<f64>,
}

impl LatencyStats {
    pub fn samples_ms(&self) -> &[f64] {
        &self.samples_ms
    }

    pub fn mean_ms(&self) -> f64 {
        if self.samples_ms.is_empty() {
            return 0.0;
        }
        self.samples_ms.iter().sum::<f64>() / self.samples_ms.len() as f64
    }
}

/// Figures derived from the mean latency.
#[derive(Debug, Clone, Copy)]
pub struct RunMetrics {
    pub per_token_latency_ms: f64,
    pub throughput_tok_s: f64,
}

impl RunMetrics {
    pub fn derive(mean_latency_ms: f64, config: &RunConfig) -> Self {
        let per_token_latency_ms = mean_latency_ms / config.new_tokens as f64;
        let throughput_tok_s = config.batch_size as f64 / (per_token_latency_ms * 1e-3);
        Self {
            per_token_latency_ms,
            throughput_tok_s,
        }
    }
}

/// Everything one combination produces before being written out.
#[derive(Debug, Clone, Copy)]
pub struct CombinationResult {
    pub mean_latency_ms: f64,
    pub metrics: RunMetrics,
    pub peak_memory_mb: f64,
}

/// Exactly one untimed execution to absorb one-time costs.
///
/// For generative workloads `expected_len` carries `prompt_length +
/// new_tokens`; a mismatch means the workload is not producing a fixed
/// token count and the run aborts. This is a consistency check, not a
/// retry point.
pub fn warmup(
    session: &DeviceSession,
    workload: &mut dyn Workload,
    expected_len: Option<usize>,
) -> Result<()> {
    info!("Warmup...");
    let out = workload.run()?;
    if let Some(expected) = expected_len {
        if out.sequence_length != expected {
            bail!(
                "warmup produced a sequence of length {} but {} was requested \
                 (prompt length + new tokens); a fixed token count is required \
                 for per-token latency arithmetic",
                out.sequence_length,
                expected,
            );
        }
    }
    session.synchronize()
}

/// Warm up, then time `num_batches` repetitions of the workload.
///
/// Each timed interval is bracketed by full drains, so the monotonic clock
/// measures device time rather than queueing overhead. The device cache is
/// deliberately not cleared between repetitions: clearing it would negate
/// the warmup.
pub fn measure_latency(
    session: &DeviceSession,
    workload: &mut dyn Workload,
    config: &RunConfig,
    expected_len: Option<usize>,
) -> Result<LatencyStats> {
    warmup(session, workload, expected_len)?;

    info!("Measuring latency...");
    let mut samples_ms = Vec::with_capacity(config.num_batches);
    for iteration in 0..config.num_batches {
        session.synchronize()?;
        let start = Instant::now();
        workload.run()?;
        session.synchronize()?;
        let latency_ms = start.elapsed().as_secs_f64() * 1e3;
        debug!(
            "iteration {}/{}: latency per token {:.3} ms",
            iteration + 1,
            config.num_batches,
            latency_ms / config.new_tokens as f64,
        );
        samples_ms.push(latency_ms);
    }
    Ok(LatencyStats { samples_ms })
}

/// Measure the peak memory of one execution.
///
/// A logically separate pass with its own warmup: the tracking scope must
/// wrap the warmup call too, since the warmup performs the allocations
/// whose peak is being measured.
pub fn measure_memory(
    session: &DeviceSession,
    workload: &mut dyn Workload,
    tracker: &MemoryTracker,
    counters: &mut dyn AllocatorCounters,
    expected_len: Option<usize>,
) -> Result<f64> {
    info!("Measuring peak memory...");
    {
        let _scope = tracker.track()?;
        warmup(session, workload, expected_len)?;
        counters.observe()?;
        workload.run()?;
        session.synchronize()?;
        counters.observe()?;
    }

    let peaks = MemoryPeaks {
        allocated_mb: counters.peak_allocated_bytes() as f64 * 1e-6,
        reserved_mb: counters.peak_reserved_bytes() as f64 * 1e-6,
        driver_mb: tracker.peak_mb(),
    };
    debug!("peak allocated (allocator): {:.2} MB", peaks.allocated_mb);
    debug!("peak device-wide (driver): {:.2} MB", peaks.driver_mb);
    debug!("peak reserved (allocator): {:.2} MB", peaks.reserved_mb);
    let peak_memory_mb = derive_peak_memory(&peaks)?;
    debug!("peak external: {:.2} MB", peaks.driver_mb - peaks.reserved_mb);
    debug!("global peak: {:.2} MB", peak_memory_mb);
    Ok(peak_memory_mb)
}

/// Run the full measurement sequence for one combination.
pub fn run_combination(
    session: &DeviceSession,
    workload: &mut dyn Workload,
    config: &RunConfig,
    expected_len: Option<usize>,
    tracker: &MemoryTracker,
    counters: &mut dyn AllocatorCounters,
) -> Result<CombinationResult> {
    counters.reset_peak()?;
    session.synchronize()?;
    let peak_memory_mb = measure_memory(session, workload, tracker, counters, expected_len)?;

    counters.reset_peak()?;
    session.synchronize()?;
    let latency = measure_latency(session, workload, config, expected_len)?;

    let mean_latency_ms = latency.mean_ms();
    let metrics = RunMetrics::derive(mean_latency_ms, config);
    Ok(CombinationResult {
        mean_latency_ms,
        metrics,
        peak_memory_mb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::WorkloadOutput;
    use crate::memory::{MockAllocatorCounters, MockMemoryProbe};
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeWorkload {
        sequence_length: usize,
        runs: usize,
    }

    impl FakeWorkload {
        fn with_length(sequence_length: usize) -> Self {
            Self {
                sequence_length,
                runs: 0,
            }
        }
    }

    impl Workload for FakeWorkload {
        fn run(&mut self) -> Result<WorkloadOutput> {
            self.runs += 1;
            Ok(WorkloadOutput {
                sequence_length: self.sequence_length,
            })
        }
    }

    fn test_tracker() -> MemoryTracker {
        MemoryTracker::new(
            Arc::new(MockMemoryProbe::constant(1_000_000_000)),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn per_token_latency_is_mean_over_new_tokens() {
        let config = RunConfig {
            batch_size: 2,
            prompt_length: 128,
            new_tokens: 32,
            num_batches: 3,
        };
        let metrics = RunMetrics::derive(128.0, &config);
        assert!((metrics.per_token_latency_ms - 4.0).abs() < 1e-12);
        assert!((metrics.throughput_tok_s - 500.0).abs() < 1e-9);
    }

    #[test]
    fn mean_latency_over_samples() {
        let stats = LatencyStats {
            samples_ms: vec![1.0, 2.0, 3.0],
        };
        assert!((stats.mean_ms() - 2.0).abs() < 1e-12);
        let empty = LatencyStats { samples_ms: vec![] };
        assert_eq!(empty.mean_ms(), 0.0);
    }

    #[test]
    fn warmup_checks_the_produced_length() {
        let session = DeviceSession::cpu();
        let mut workload = FakeWorkload::with_length(160);
        warmup(&session, &mut workload, Some(160)).unwrap();
        assert!(warmup(&session, &mut workload, Some(161)).is_err());
        // Non-generative runs skip the check.
        warmup(&session, &mut workload, None).unwrap();
    }

    #[test]
    fn latency_runs_warmup_plus_num_batches() {
        let session = DeviceSession::cpu();
        let config = RunConfig {
            batch_size: 1,
            prompt_length: 8,
            new_tokens: 4,
            num_batches: 5,
        };
        let mut workload = FakeWorkload::with_length(12);
        let stats = measure_latency(&session, &mut workload, &config, Some(12)).unwrap();
        assert_eq!(stats.samples_ms().len(), 5);
        assert_eq!(workload.runs, 6);
    }

    #[test]
    fn memory_pass_wraps_its_own_warmup() {
        let session = DeviceSession::cpu();
        let tracker = test_tracker();
        // Driver peak 1000 MB, reserved 200 MB, allocated 300 MB.
        let mut counters = MockAllocatorCounters::with_peaks(300_000_000, 200_000_000);
        let mut workload = FakeWorkload::with_length(12);
        let peak =
            measure_memory(&session, &mut workload, &tracker, &mut counters, Some(12)).unwrap();
        assert!((peak - 1100.0).abs() < 1e-9);
        // Warmup plus the measured execution.
        assert_eq!(workload.runs, 2);
        assert_eq!(counters.observations(), 2);
    }

    #[test]
    fn combination_resets_counters_for_each_sub_benchmark() {
        let session = DeviceSession::cpu();
        let tracker = test_tracker();
        let mut counters = MockAllocatorCounters::with_peaks(300_000_000, 200_000_000);
        let config = RunConfig {
            batch_size: 2,
            prompt_length: 8,
            new_tokens: 4,
            num_batches: 3,
        };
        let mut workload = FakeWorkload::with_length(12);
        let result = run_combination(
            &session,
            &mut workload,
            &config,
            Some(12),
            &tracker,
            &mut counters,
        )
        .unwrap();
        assert_eq!(counters.resets(), 2);
        // Memory pass: warmup + run. Latency pass: warmup + 3 timed runs.
        assert_eq!(workload.runs, 6);
        assert!((result.peak_memory_mb - 1100.0).abs() < 1e-9);
        assert!(result.metrics.per_token_latency_ms >= 0.0);
    }

    #[test]
    fn length_mismatch_aborts_before_any_latency_sample() {
        let session = DeviceSession::cpu();
        let tracker = test_tracker();
        let mut counters = MockAllocatorCounters::with_peaks(300_000_000, 200_000_000);
        let config = RunConfig {
            batch_size: 1,
            prompt_length: 8,
            new_tokens: 4,
            num_batches: 3,
        };
        let mut workload = FakeWorkload::with_length(999);
        let result = run_combination(
            &session,
            &mut workload,
            &config,
            Some(12),
            &tracker,
            &mut counters,
        );
        assert!(result.is_err());
        // The first warmup already failed; nothing else ran.
        assert_eq!(workload.runs, 1);
    }
}
