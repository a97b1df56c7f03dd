//! Token sampling strategies

use anyhow::Result;
use candle_core::{DType, Tensor};
use kiln_runtime_api::SamplingParams;

pub struct Sampler {
    temperature: f32,
    top_p: Option<f32>,
    repetition_penalty: f32,
    repetition_context_size: usize,
    rng_state: u64,
}

impl Sampler {
    pub fn new(params: &SamplingParams) -> Self {
        let seed = params.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x2545_f491_4f6c_dd1d)
        });

        Self {
            temperature: params.temperature,
            top_p: params.top_p.filter(|p| *p > 0.0 && *p < 1.0),
            repetition_penalty: params.repetition_penalty,
            repetition_context_size: params.repetition_context_size,
            // xorshift must never be seeded with zero
            rng_state: seed.max(1),
        }
    }

    /// Pick the next token from `logits`, penalising tokens seen in the tail
    /// of `context`.
    pub fn sample(&mut self, logits: &Tensor, context: &[u32]) -> Result<u32> {
        let mut logits = logits.to_dtype(DType::F32)?;

        if self.repetition_penalty != 1.0 && !context.is_empty() {
            let start = context.len().saturating_sub(self.repetition_context_size);
            logits = candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repetition_penalty,
                &context[start..],
            )?;
        }

        let logits = logits.to_vec1::<f32>()?;

        if self.temperature <= 0.0 {
            return Ok(argmax(&logits));
        }

        // Apply temperature
        let scaled: Vec<f32> = logits.iter().map(|&x| x / self.temperature).collect();

        // Softmax
        let max_logit = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = scaled.iter().map(|&x| (x - max_logit).exp()).collect();
        let sum: f32 = exp.iter().sum();
        let probs: Vec<f32> = exp.iter().map(|&x| x / sum).collect();

        let token = match self.top_p {
            Some(top_p) => self.sample_top_p(&probs, top_p),
            None => self.sample_multinomial(&probs),
        };

        Ok(token)
    }

    fn sample_top_p(&mut self, probs: &[f32], top_p: f32) -> u32 {
        // Sort by probability descending
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        // Find cutoff for top-p
        let mut cumsum = 0.0;
        let mut cutoff_idx = indexed.len();
        for (i, (_, p)) in indexed.iter().enumerate() {
            cumsum += p;
            if cumsum >= top_p {
                cutoff_idx = i + 1;
                break;
            }
        }

        // Renormalize and sample
        let candidates = &indexed[..cutoff_idx];
        let sum: f32 = candidates.iter().map(|(_, p)| p).sum();

        let r = self.random_f32() * sum;
        let mut cumsum = 0.0;
        for (idx, p) in candidates {
            cumsum += p;
            if r < cumsum {
                return *idx as u32;
            }
        }

        candidates.last().map(|(idx, _)| *idx as u32).unwrap_or(0)
    }

    fn sample_multinomial(&mut self, probs: &[f32]) -> u32 {
        let r = self.random_f32();
        let mut cumsum = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p;
            if r < cumsum {
                return i as u32;
            }
        }
        probs.len().saturating_sub(1) as u32
    }

    fn random_f32(&mut self) -> f32 {
        // Simple xorshift64 PRNG
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;

        // Convert to f32 in [0, 1)
        (self.rng_state as f64 / u64::MAX as f64) as f32
    }
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}
