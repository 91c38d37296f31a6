//! Model loading and management
//!
//! Handles downloading models from HuggingFace Hub and loading them into
//! memory, either as dense safetensors weights or as quantized GGUF weights
//! from a local directory. The tokenizer always comes from the hub model id,
//! which in the quantized case names the reference architecture.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig};
use candle_transformers::models::quantized_llama::ModelWeights;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::info;

use crate::device::DeviceSession;

/// File name of the quantized weights inside a quantized model directory.
pub const QUANTIZED_WEIGHTS_FILE: &str = "model.gguf";

/// Benchmark task. Decoder tasks run the full generation loop; anything
/// else is measured as a single forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    TextGeneration,
    Text2TextGeneration,
    FeatureExtraction,
}

impl Task {
    /// Infer the task from the model id when none is given on the CLI.
    pub fn infer_from_model_id(model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        if lower.contains("t5") || lower.contains("bart") || lower.contains("pegasus") {
            Task::Text2TextGeneration
        } else if lower.contains("bert") || lower.contains("minilm") || lower.contains("embed") {
            Task::FeatureExtraction
        } else {
            Task::TextGeneration
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "text-generation" => Ok(Task::TextGeneration),
            "text2text-generation" => Ok(Task::Text2TextGeneration),
            "feature-extraction" => Ok(Task::FeatureExtraction),
            other => bail!(
                "unknown task '{other}' (expected text-generation, text2text-generation \
                 or feature-extraction)"
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Task::TextGeneration => "text-generation",
            Task::Text2TextGeneration => "text2text-generation",
            Task::FeatureExtraction => "feature-extraction",
        }
    }

    pub fn is_decoder(self) -> bool {
        matches!(self, Task::TextGeneration | Task::Text2TextGeneration)
    }
}

/// Configuration for model loading
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// HuggingFace model ID (e.g., "meta-llama/Llama-3.2-1B")
    pub model_id: String,
    /// Model revision/branch
    pub revision: String,
    /// Data type for dense model weights
    pub dtype: DType,
    /// Benchmark task; inferred from the model id when `None`
    pub task: Option<Task>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: "main".to_string(),
            dtype: DType::F16,
            task: None,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.task = Some(task);
        self
    }

    pub fn task(&self) -> Task {
        self.task
            .unwrap_or_else(|| Task::infer_from_model_id(&self.model_id))
    }
}

/// Timing of the load phase. The clock stops only after a device drain so
/// queued transfer work counts toward the load.
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub load_time_secs: f64,
}

/// Loaded weights, dense or quantized.
pub enum ModelKind {
    Dense {
        model: Llama,
        config: Config,
        cache: Cache,
    },
    Quantized(ModelWeights),
}

/// Loaded model ready for benchmarking
pub struct LoadedModel {
    pub kind: ModelKind,
    pub tokenizer: Tokenizer,
    pub vocab_size: usize,
    pub pad_token_id: u32,
    pub device: Device,
    pub dtype: DType,
}

/// One decode step of a causal model. The seam lets tests drive the
/// generation loop with a deterministic fake instead of real weights.
pub trait DecoderModel {
    /// Prepare for a fresh run starting at position zero.
    fn begin_run(&mut self) -> Result<()>;
    /// Forward the given token ids at `index_pos`, returning last-position
    /// logits of shape `(batch_size, vocab_size)`.
    fn step(&mut self, input: &Tensor, index_pos: usize) -> Result<Tensor>;
}

impl LoadedModel {
    pub fn is_quantized(&self) -> bool {
        matches!(self.kind, ModelKind::Quantized(_))
    }
}

impl DecoderModel for LoadedModel {
    fn begin_run(&mut self) -> Result<()> {
        // The quantized path rebuilds its KV cache whenever a forward starts
        // at position zero; the dense cache must be recreated explicitly.
        if let ModelKind::Dense { config, cache, .. } = &mut self.kind {
            *cache = Cache::new(true, self.dtype, config, &self.device)?;
        }
        Ok(())
    }

    fn step(&mut self, input: &Tensor, index_pos: usize) -> Result<Tensor> {
        match &mut self.kind {
            ModelKind::Dense { model, cache, .. } => Ok(model.forward(input, index_pos, cache)?),
            ModelKind::Quantized(model) => Ok(model.forward(input, index_pos)?),
        }
    }
}

fn resolve_pad_token(tokenizer: &Tokenizer) -> u32 {
    // Falls back on the end-of-sequence token when the tokenizer carries no
    // padding token, mirroring common causal-LM tokenizer setups.
    for token in ["<pad>", "[PAD]", "</s>", "<|endoftext|>", "<|end_of_text|>"] {
        if let Some(id) = tokenizer.token_to_id(token) {
            return id;
        }
    }
    0
}

/// Load safetensors files (handles both single and sharded models)
fn load_safetensors(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    match repo.get("model.safetensors.index.json") {
        Ok(json_file) => {
            let json: serde_json::Value =
                serde_json::from_reader(&std::fs::File::open(&json_file)?)?;
            let weight_map = match json.get("weight_map") {
                Some(serde_json::Value::Object(map)) => map,
                _ => bail!("no weight map in {:?}", json_file),
            };

            let mut safetensors_files = std::collections::HashSet::new();
            for value in weight_map.values() {
                if let Some(file) = value.as_str() {
                    safetensors_files.insert(file.to_string());
                }
            }

            let safetensors_files = safetensors_files
                .iter()
                .map(|v| repo.get(v))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(safetensors_files)
        }
        // Single model.safetensors file
        Err(_) => Ok(vec![repo.get("model.safetensors")?]),
    }
}

fn load_tokenizer(repo: &hf_hub::api::sync::ApiRepo) -> Result<Tokenizer> {
    info!("Loading tokenizer...");
    let tokenizer_file = repo.get("tokenizer.json")?;
    Tokenizer::from_file(&tokenizer_file).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))
}

fn hub_repo(config: &ModelConfig) -> Result<hf_hub::api::sync::ApiRepo> {
    let api = Api::new()?;
    Ok(api.repo(Repo::with_revision(
        config.model_id.clone(),
        RepoType::Model,
        config.revision.clone(),
    )))
}

/// Load a dense model from HuggingFace Hub.
pub fn load_model(
    config: &ModelConfig,
    session: &DeviceSession,
) -> Result<(LoadedModel, LoadReport)> {
    info!("Loading model: {}", config.model_id);
    let start = Instant::now();

    let repo = hub_repo(config)?;
    let tokenizer = load_tokenizer(&repo)?;

    info!("Loading model config...");
    let config_file = repo.get("config.json")?;
    let llama_config: LlamaConfig = serde_json::from_slice(&std::fs::read(&config_file)?)?;
    let model_config = llama_config.into_config(false);

    info!("Loading model weights...");
    let filenames = load_safetensors(&repo)?;
    info!("Loading {} safetensor file(s)", filenames.len());

    let vb =
        unsafe { VarBuilder::from_mmaped_safetensors(&filenames, config.dtype, session.device())? };
    let model = Llama::load(vb, &model_config).map_err(|e| anyhow!("Failed to load model: {}", e))?;
    let cache = Cache::new(true, config.dtype, &model_config, session.device())?;

    session.synchronize()?;
    let load_time_secs = start.elapsed().as_secs_f64();

    let vocab_size = model_config.vocab_size;
    let pad_token_id = resolve_pad_token(&tokenizer);
    info!("Model loaded successfully!");
    info!("  - Vocab size: {}", vocab_size);
    info!("  - Hidden size: {}", model_config.hidden_size);
    info!("  - Layers: {}", model_config.num_hidden_layers);

    Ok((
        LoadedModel {
            kind: ModelKind::Dense {
                model,
                config: model_config,
                cache,
            },
            tokenizer,
            vocab_size,
            pad_token_id,
            device: session.device().clone(),
            dtype: config.dtype,
        },
        LoadReport { load_time_secs },
    ))
}

/// Load quantized weights from a local directory. The tokenizer still comes
/// from the hub model id naming the reference architecture.
pub fn load_quantized_model(
    config: &ModelConfig,
    quantized_dir: &Path,
    session: &DeviceSession,
) -> Result<(LoadedModel, LoadReport)> {
    info!(
        "Loading quantized model from {} (reference architecture {})",
        quantized_dir.display(),
        config.model_id
    );
    let start = Instant::now();

    let repo = hub_repo(config)?;
    let tokenizer = load_tokenizer(&repo)?;

    let weights_path = quantized_dir.join(QUANTIZED_WEIGHTS_FILE);
    let mut weights_file = std::fs::File::open(&weights_path)
        .with_context(|| format!("no quantized weights at {}", weights_path.display()))?;
    let content =
        gguf_file::Content::read(&mut weights_file).map_err(|e| e.with_path(&weights_path))?;
    let model = ModelWeights::from_gguf(content, &mut weights_file, session.device())?;

    session.synchronize()?;
    let load_time_secs = start.elapsed().as_secs_f64();

    let vocab_size = tokenizer.get_vocab_size(true);
    let pad_token_id = resolve_pad_token(&tokenizer);
    info!("Quantized model loaded successfully!");
    info!("  - Vocab size: {}", vocab_size);

    Ok((
        LoadedModel {
            kind: ModelKind::Quantized(model),
            tokenizer,
            vocab_size,
            pad_token_id,
            device: session.device().clone(),
            dtype: config.dtype,
        },
        LoadReport { load_time_secs },
    ))
}
