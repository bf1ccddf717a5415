use super::{rng::MinStdRand, Sampler, SamplerParams, MAX_TEMPERATURE, MIN_TEMPERATURE};
use crate::{Error, Result, Status};

const TEMPERATURE_EPSILON: f32 = 1e-6;

/// Top-k, then top-p truncation, then temperature reweighting of the survivors.
#[derive(Debug, Clone)]
pub struct NucleusSampler {
    rng: MinStdRand,
    /// Candidate ids, reused across calls.
    index: Vec<usize>,
    /// Unnormalized (later normalized) probabilities, reused across calls.
    probs: Vec<f32>,
}

/// Seeds pass through a 32-bit signed integer, sign-extended, before reaching the
/// generator. Only the low 32 bits of a seed matter.
fn narrow_seed(seed: u64) -> u64 {
    seed as i32 as i64 as u64
}

impl NucleusSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: MinStdRand::new(narrow_seed(seed)),
            index: Vec::new(),
            probs: Vec::new(),
        }
    }
}

impl Default for NucleusSampler {
    fn default() -> Self {
        Self::new(fastrand::u64(..))
    }
}

/// Index of the first maximum.
pub fn argmax(logits: &[f32]) -> usize {
    let mut index = 0;
    for (id, &x) in logits.iter().enumerate().skip(1) {
        if x > logits[index] {
            index = id;
        }
    }
    index
}

impl Sampler for NucleusSampler {
    fn set_seed(&mut self, seed: u64) {
        self.rng.seed(narrow_seed(seed));
    }

    fn sample(&mut self, logits: &[f32], params: &SamplerParams) -> Result<u32> {
        let size = logits.len();
        if size == 0 {
            return Err(Error::new(
                Status::SAMPLER | Status::INVALID_PARAMETERS,
                "cannot sample from empty logits",
            ));
        }

        let temperature = params.temperature.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE);
        let top_k = params.top_k.min(size);
        let max = argmax(logits);
        if top_k <= 1 {
            return Ok(max as u32);
        }

        let NucleusSampler { rng, index, probs } = self;

        // softmax base
        let max_logit = logits[max];
        index.clear();
        index.extend(0..size);
        probs.clear();
        probs.extend(logits.iter().map(|&x| (x - max_logit).exp()));
        let mut sum = 0.0f32;
        for &x in probs.iter() {
            sum += x;
        }

        // top-k
        if top_k != size {
            index.select_nth_unstable_by(top_k, |&i, &j| probs[j].total_cmp(&probs[i]));
        }
        index[..top_k].sort_unstable_by(|&i, &j| probs[j].total_cmp(&probs[i]));

        // top-p
        let mut len = top_k;
        let mut cumsum = 0.0f32;
        for (rank, &id) in index[..top_k].iter().enumerate() {
            probs[id] /= sum;
            cumsum += probs[id];
            if cumsum >= params.top_p {
                len = rank + 1;
                break;
            }
        }

        // temperature, applied to the truncated probabilities without renormalizing
        if (temperature - 1.0).abs() > TEMPERATURE_EPSILON {
            cumsum = 0.0;
            for &id in &index[..len] {
                probs[id] = probs[id].powf(1.0 / temperature);
                cumsum += probs[id];
            }
        }

        let threshold = (rng.next_unit() * cumsum as f64) as f32;
        let candidates = &index[..len];
        let mut cumsum = 0.0f32;
        for &id in candidates {
            cumsum += probs[id];
            if cumsum >= threshold {
                return Ok(id as u32);
            }
        }

        // rounding left the draw above the accumulated mass
        let last = candidates[len - 1];
        Ok(last as u32)
    }
}
