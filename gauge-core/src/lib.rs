//! Gauge Core - latency/throughput/memory benchmarking for LLM inference
//!
//! This crate implements the measurement primitives behind the `gauge-bench`
//! CLI:
//! - Model loading from HuggingFace Hub, dense or quantized
//! - Fixed-length generation workloads (no end-of-sequence early stop)
//! - Drain-bracketed latency timing and two-view peak-memory tracking
//! - Sweep grid construction and the append-only CSV result log

pub mod device;
pub mod generate;
pub mod harness;
pub mod memory;
pub mod model;
pub mod quant;
pub mod report;
pub mod sweep;

pub use device::{visible_device_count, DeviceSession, VISIBLE_DEVICES_VAR};
pub use generate::{
    synthetic_inputs, ForwardWorkload, GenerateWorkload, GenerationSpec, SyntheticInputs, Workload,
    WorkloadOutput,
};
pub use harness::{
    measure_latency, measure_memory, run_combination, warmup, CombinationResult, LatencyStats,
    RunConfig, RunMetrics,
};
pub use memory::{
    derive_peak_memory, AllocatorCounters, CudaAllocatorCounters, CudaMemoryProbe, MemoryPeaks,
    MemoryProbe, MemoryTracker, MockAllocatorCounters, MockMemoryProbe,
};
pub use model::{
    load_model, load_quantized_model, DecoderModel, LoadReport, LoadedModel, ModelConfig, Task,
};
pub use quant::{
    select_kernel, Kernel, QuantizationConfig, QuantizationDescriptors, QUANTIZATION_CONFIG_FILE,
};
pub use report::{log_file_name, CsvReport, ResultRow, CSV_HEADER};
pub use sweep::{RunShape, SweepGrid};
