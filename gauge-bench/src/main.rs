//! gauge-bench - latency/throughput/memory benchmark for (optionally
//! quantized) LLM inference
//!
//! Loads a model, then for every (batch_size, prompt_length, new_tokens)
//! combination in the configured grid measures peak memory and mean
//! latency, appending one CSV row per combination.

use anyhow::{bail, Result};
use clap::Parser;
use gauge_core::{
    log_file_name, run_combination, select_kernel, synthetic_inputs, CsvReport,
    CudaAllocatorCounters, CudaMemoryProbe, DeviceSession, ForwardWorkload, GenerateWorkload,
    GenerationSpec, MemoryTracker, ModelConfig, QuantizationConfig, QuantizationDescriptors,
    ResultRow, RunConfig, SweepGrid, Task,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Seed for the synthetic prompts, fixed so runs are comparable.
const INPUT_SEED: u64 = 42;

/// Polling interval of the driver-level memory tracker.
const TRACKER_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(
    name = "gauge-bench",
    about = "Latency/throughput/memory benchmark for (optionally quantized) LLM inference"
)]
struct Args {
    /// Model to benchmark (in the non-quantized case), or reference
    /// architecture corresponding to the quantized model.
    #[arg(long)]
    model: String,

    /// Path to a local quantized model directory.
    #[arg(long)]
    gptq_model: Option<PathBuf>,

    /// Task name; inferred from the model id when omitted.
    #[arg(long)]
    task: Option<String>,

    /// Number of timed repetitions per combination.
    #[arg(long, default_value_t = 10)]
    num_batches: usize,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 256)]
    prompt_length: usize,

    #[arg(long, default_value_t = 256)]
    new_tokens: usize,

    /// For decoder models, benchmark only the prefill step with
    /// `prompt_length`.
    #[arg(long, default_value_t = false)]
    prefill: bool,

    /// Indicate that the model to benchmark is a quantized model.
    #[arg(long, default_value_t = false)]
    gptq: bool,

    /// Use the fixed parameter grid for (batch_size, prompt_length,
    /// new_tokens) instead of the CLI values.
    #[arg(long, default_value_t = false)]
    sweep: bool,

    /// Disable the exllama kernel, to rather use the CUDA (act-order case)
    /// or CUDA-old (no act-order case) kernels.
    #[arg(long, default_value_t = false)]
    disable_exllama: bool,
}

/// Configuration checks that must fail before anything is downloaded or
/// loaded.
fn validate_args(args: &Args) -> Result<()> {
    if args.gptq && args.gptq_model.is_none() {
        bail!("the --gptq-model argument needs to be provided when benchmarking a quantized model");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    let grid = SweepGrid::from_args(
        args.sweep,
        args.prefill,
        args.batch_size,
        args.prompt_length,
        args.new_tokens,
    );
    if args.prefill {
        info!("Running the prefill benchmark: generating only one new token.");
    }

    validate_args(&args)?;

    // Environment checks happen before any tokenizer or model download.
    let session = DeviceSession::acquire()?;

    let task = match &args.task {
        Some(name) => Task::parse(name)?,
        None => Task::infer_from_model_id(&args.model),
    };
    info!("Task: {}", task.as_str());

    let descriptors = match args.gptq_model.as_deref().filter(|_| args.gptq) {
        Some(dir) => {
            let quant_config = QuantizationConfig::from_model_dir(dir)?;
            let kernel = select_kernel(args.disable_exllama, quant_config.desc_act);
            QuantizationDescriptors::from_config(&quant_config, kernel)
        }
        None => QuantizationDescriptors::none(),
    };

    let model_config = ModelConfig::new(&args.model).with_task(task);
    let (mut model, load_report) = match args.gptq_model.as_deref().filter(|_| args.gptq) {
        Some(dir) => gauge_core::load_quantized_model(&model_config, dir, &session)?,
        None => gauge_core::load_model(&model_config, &session)?,
    };

    info!("Model load time: {:.1} s", load_report.load_time_secs);
    info!("Model uses quantized weights: {}", descriptors.used);
    info!("Bits: {:?}", descriptors.bits);
    info!("group_size: {:?}", descriptors.group_size);
    info!("act_order: {:?}", descriptors.act_order);
    info!("kernel: {:?}", descriptors.kernel.map(|k| k.csv_name()));

    let tracker = MemoryTracker::new(Arc::new(CudaMemoryProbe::new()?), TRACKER_INTERVAL);
    let mut counters = CudaAllocatorCounters::new()?;

    let file_name = log_file_name(&args.model, descriptors.used);
    let mut report = CsvReport::create(Path::new(&file_name))?;
    info!("Writing results to {file_name}");
    warn!(
        "The reported peak memory is only a rough estimate, and can NOT be precisely relied \
         upon to estimate an OOM limit."
    );

    let vocab_size = model.vocab_size;
    let pad_token_id = model.pad_token_id;
    for shape in grid.shapes() {
        info!(
            "---- Running: batch_size={}, prompt_length={}, new_tokens={}",
            shape.batch_size, shape.prompt_length, shape.new_tokens
        );
        let config = RunConfig {
            batch_size: shape.batch_size,
            prompt_length: shape.prompt_length,
            new_tokens: shape.new_tokens,
            num_batches: args.num_batches,
        };
        let inputs = synthetic_inputs(
            shape.batch_size,
            shape.prompt_length,
            vocab_size,
            INPUT_SEED,
            &session,
        )?;

        let result = if task.is_decoder() {
            let spec = GenerationSpec {
                new_tokens: shape.new_tokens,
                pad_token_id,
            };
            let mut workload = GenerateWorkload::new(&mut model, &inputs, spec);
            let expected = Some(shape.prompt_length + shape.new_tokens);
            run_combination(&session, &mut workload, &config, expected, &tracker, &mut counters)?
        } else {
            let mut workload = ForwardWorkload::new(&mut model, &inputs);
            run_combination(&session, &mut workload, &config, None, &tracker, &mut counters)?
        };

        info!(
            "Latency per token: {:.3} ms, throughput: {:.3} tok/s, peak mem: {:.2} MB",
            result.metrics.per_token_latency_ms,
            result.metrics.throughput_tok_s,
            result.peak_memory_mb
        );

        let row = ResultRow::new(descriptors, &config, load_report.load_time_secs, &result);
        report.append(&row)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv.iter().copied()).unwrap()
    }

    #[test]
    fn model_is_required() {
        assert!(Args::try_parse_from(["gauge-bench"]).is_err());
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let args = parse(&["gauge-bench", "--model", "gpt2"]);
        assert_eq!(args.num_batches, 10);
        assert_eq!(args.batch_size, 1);
        assert_eq!(args.prompt_length, 256);
        assert_eq!(args.new_tokens, 256);
        assert!(!args.gptq);
        assert!(!args.sweep);
        assert!(!args.prefill);
        assert!(!args.disable_exllama);
    }

    #[test]
    fn single_combination_from_cli_values() {
        let args = parse(&[
            "gauge-bench",
            "--model",
            "gpt2",
            "--batch-size",
            "2",
            "--prompt-length",
            "128",
            "--new-tokens",
            "32",
            "--num-batches",
            "3",
        ]);
        let grid = SweepGrid::from_args(
            args.sweep,
            args.prefill,
            args.batch_size,
            args.prompt_length,
            args.new_tokens,
        );
        assert_eq!(grid.len(), 1);
        let shape = grid.shapes()[0];
        assert_eq!(shape.batch_size, 2);
        assert_eq!(shape.prompt_length, 128);
        assert_eq!(shape.new_tokens, 32);
    }

    #[test]
    fn sweep_flag_overrides_cli_shape() {
        let args = parse(&[
            "gauge-bench",
            "--model",
            "gpt2",
            "--sweep",
            "--batch-size",
            "3",
            "--prompt-length",
            "7",
        ]);
        let grid = SweepGrid::from_args(
            args.sweep,
            args.prefill,
            args.batch_size,
            args.prompt_length,
            args.new_tokens,
        );
        assert_eq!(grid.len(), 5);
        assert!(grid.shapes().iter().all(|s| s.prompt_length == 512));
    }

    #[test]
    fn prefill_forces_a_single_new_token() {
        let args = parse(&["gauge-bench", "--model", "gpt2", "--prefill"]);
        let grid = SweepGrid::from_args(
            args.sweep,
            args.prefill,
            args.batch_size,
            args.prompt_length,
            args.new_tokens,
        );
        assert_eq!(grid.shapes()[0].new_tokens, 1);
    }

    #[test]
    fn quantized_mode_requires_the_model_path() {
        let args = parse(&["gauge-bench", "--model", "gpt2", "--gptq"]);
        let err = validate_args(&args).unwrap_err();
        assert!(err.to_string().contains("--gptq-model"));

        let args = parse(&[
            "gauge-bench",
            "--model",
            "gpt2",
            "--gptq",
            "--gptq-model",
            "/tmp/q",
        ]);
        validate_args(&args).unwrap();
    }
}
