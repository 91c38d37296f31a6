//! Execution grid construction
//!
//! Sweep mode replaces the CLI-provided shape with a fixed grid; prefill
//! mode then forces a single generated token. The precedence is sweep
//! first, prefill second, so `--sweep --prefill` benchmarks the sweep's
//! batch sizes at one new token each.

/// Fixed sweep axes.
pub const SWEEP_BATCH_SIZES: &[usize] = &[1, 2, 4, 8, 16];
pub const SWEEP_PROMPT_LENGTHS: &[usize] = &[512];
pub const SWEEP_NEW_TOKENS: &[usize] = &[512];

/// One `(batch_size, prompt_length, new_tokens)` combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunShape {
    pub batch_size: usize,
    pub prompt_length: usize,
    pub new_tokens: usize,
}

/// Ordered set of combinations to benchmark. Exactly one result row is
/// emitted per entry.
#[derive(Debug, Clone)]
pub struct SweepGrid {
    shapes: Vec<RunShape>,
}

impl SweepGrid {
    pub fn from_args(
        sweep: bool,
        prefill: bool,
        batch_size: usize,
        prompt_length: usize,
        new_tokens: usize,
    ) -> Self {
        let (batch_sizes, prompt_lengths, mut new_token_counts) = if sweep {
            (
                SWEEP_BATCH_SIZES.to_vec(),
                SWEEP_PROMPT_LENGTHS.to_vec(),
                SWEEP_NEW_TOKENS.to_vec(),
            )
        } else {
            (vec![batch_size], vec![prompt_length], vec![new_tokens])
        };
        if prefill {
            new_token_counts = vec![1];
        }

        let mut shapes = Vec::new();
        for &batch_size in &batch_sizes {
            for &prompt_length in &prompt_lengths {
                for &new_tokens in &new_token_counts {
                    shapes.push(RunShape {
                        batch_size,
                        prompt_length,
                        new_tokens,
                    });
                }
            }
        }
        Self { shapes }
    }

    pub fn shapes(&self) -> &[RunShape] {
        &self.shapes
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}
