//! Fixed-length generation workloads
//!
//! The benchmark measures a callable, not a conversation: the decoder
//! workload produces exactly the requested number of tokens with greedy
//! decoding and no end-of-sequence early stop, otherwise per-token latency
//! arithmetic would be meaningless.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::DeviceSession;
use crate::model::DecoderModel;

/// Device-resident input tensors shared by every run of one combination.
pub struct SyntheticInputs {
    /// Token ids, shape `(batch_size, prompt_length)`
    pub input_ids: Tensor,
    /// All-ones mask of the same shape. The llama path applies causal
    /// masking internally; the tensor still participates in the measured
    /// footprint.
    pub attention_mask: Tensor,
    pub batch_size: usize,
    pub prompt_length: usize,
}

/// Build random prompts of the requested shape, with token ids drawn
/// uniformly from `[1, vocab_size - 1)`.
pub fn synthetic_inputs(
    batch_size: usize,
    prompt_length: usize,
    vocab_size: usize,
    seed: u64,
    session: &DeviceSession,
) -> Result<SyntheticInputs> {
    ensure!(vocab_size > 2, "vocab size {vocab_size} is too small");
    let mut rng = StdRng::seed_from_u64(seed);
    let upper = vocab_size as u32 - 1;
    let ids: Vec<u32> = (0..batch_size * prompt_length)
        .map(|_| rng.gen_range(1..upper))
        .collect();
    let input_ids = Tensor::from_vec(ids, (batch_size, prompt_length), session.device())?;
    let attention_mask = Tensor::ones((batch_size, prompt_length), DType::U32, session.device())?;
    Ok(SyntheticInputs {
        input_ids,
        attention_mask,
        batch_size,
        prompt_length,
    })
}

/// Generation parameters for one combination. Early stopping is disabled by
/// construction: nothing in the loop consults an end-of-sequence token.
#[derive(Debug, Clone, Copy)]
pub struct GenerationSpec {
    pub new_tokens: usize,
    pub pad_token_id: u32,
}

pub struct WorkloadOutput {
    /// Token length of the produced batch, prompt included.
    pub sequence_length: usize,
}

/// One measurable execution. The harness only ever calls `run`, so tests
/// can substitute any deterministic implementation.
pub trait Workload {
    fn run(&mut self) -> Result<WorkloadOutput>;
}

/// Decoder path: greedy generation of exactly `new_tokens` tokens.
pub struct GenerateWorkload<'a, M: DecoderModel> {
    model: &'a mut M,
    inputs: &'a SyntheticInputs,
    spec: GenerationSpec,
}

impl<'a, M: DecoderModel> GenerateWorkload<'a, M> {
    pub fn new(model: &'a mut M, inputs: &'a SyntheticInputs, spec: GenerationSpec) -> Self {
        Self {
            model,
            inputs,
            spec,
        }
    }
}

impl<M: DecoderModel> Workload for GenerateWorkload<'_, M> {
    fn run(&mut self) -> Result<WorkloadOutput> {
        ensure!(self.spec.new_tokens > 0, "generation requires at least one new token");
        self.model.begin_run()?;

        let mut generated: Vec<Tensor> = Vec::with_capacity(self.spec.new_tokens);

        // Prefill over the full prompt, then decode one token at a time.
        let logits = self.model.step(&self.inputs.input_ids, 0)?;
        let mut next = logits.argmax(D::Minus1)?.unsqueeze(1)?;
        generated.push(next.clone());

        let mut index_pos = self.inputs.prompt_length;
        while generated.len() < self.spec.new_tokens {
            let logits = self.model.step(&next, index_pos)?;
            next = logits.argmax(D::Minus1)?.unsqueeze(1)?;
            generated.push(next.clone());
            index_pos += 1;
        }

        let mut columns = vec![self.inputs.input_ids.clone()];
        columns.extend(generated);
        let output = Tensor::cat(&columns, 1)?;
        Ok(WorkloadOutput {
            sequence_length: output.dim(1)?,
        })
    }
}

/// Non-decoder path: a single forward pass over the prompt.
pub struct ForwardWorkload<'a, M: DecoderModel> {
    model: &'a mut M,
    inputs: &'a SyntheticInputs,
}

impl<'a, M: DecoderModel> ForwardWorkload<'a, M> {
    pub fn new(model: &'a mut M, inputs: &'a SyntheticInputs) -> Self {
        Self { model, inputs }
    }
}

impl<M: DecoderModel> Workload for ForwardWorkload<'_, M> {
    fn run(&mut self) -> Result<WorkloadOutput> {
        self.model.begin_run()?;
        let _logits = self.model.step(&self.inputs.input_ids, 0)?;
        Ok(WorkloadOutput {
            sequence_length: self.inputs.prompt_length,
        })
    }
}
