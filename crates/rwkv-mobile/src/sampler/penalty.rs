use std::collections::HashMap;

use super::PenaltyParams;

/// Decaying occurrence counts of emitted tokens.
#[derive(Debug, Default, Clone)]
pub struct Penalties {
    occurrences: HashMap<u32, f32>,
}

impl Penalties {
    /// Penalize `output` by the current counts, then decay every count for the next step.
    pub fn transform(&mut self, params: &PenaltyParams, output: &mut [f32]) {
        for (&token, occurrence) in self.occurrences.iter_mut() {
            if let Some(logit) = output.get_mut(token as usize) {
                *logit -= params.frequency_penalty * *occurrence + params.presence_penalty;
            }
            *occurrence *= params.penalty_decay;
        }
    }

    /// Record an accepted token.
    pub fn update(&mut self, token: u32) {
        *self.occurrences.entry(token).or_default() += 1.0;
    }

    pub fn clear(&mut self) {
        self.occurrences.clear();
    }

    pub fn get(&self, token: u32) -> Option<f32> {
        self.occurrences.get(&token).copied()
    }

    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.occurrences.iter().map(|(&token, &count)| (token, count))
    }
}
