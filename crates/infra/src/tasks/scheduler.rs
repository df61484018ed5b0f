//! Weighted queue selection.
//!
//! Smooth weighted round-robin: every round each queue's running score grows
//! by its weight, the highest score is picked and pays back the total weight.
//! Over any window of `sum(weights)` rounds each queue is picked exactly
//! `weight` times, and picks are interleaved rather than bunched.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WeightError {
    #[error("at least one queue must be configured")]
    Empty,
    #[error("queue name must not be empty")]
    EmptyName,
    #[error("queue {0} must have a positive weight")]
    ZeroWeight(String),
    #[error("queue {0} is configured twice")]
    Duplicate(String),
}

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    weight: i64,
    score: i64,
}

#[derive(Debug, Clone)]
pub struct WeightedQueues {
    slots: Vec<Slot>,
    total: i64,
}

impl WeightedQueues {
    pub fn new<I, S>(queues: I) -> Result<Self, WeightError>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut slots: Vec<Slot> = Vec::new();
        for (name, weight) in queues {
            let name = name.into();
            if name.is_empty() {
                return Err(WeightError::EmptyName);
            }
            if weight == 0 {
                return Err(WeightError::ZeroWeight(name));
            }
            if slots.iter().any(|s| s.name == name) {
                return Err(WeightError::Duplicate(name));
            }
            slots.push(Slot {
                name,
                weight: i64::from(weight),
                score: 0,
            });
        }

        if slots.is_empty() {
            return Err(WeightError::Empty);
        }
        let total = slots.iter().map(|s| s.weight).sum();
        Ok(Self { slots, total })
    }

    fn advance(&mut self) -> usize {
        for slot in &mut self.slots {
            slot.score += slot.weight;
        }

        // Ties go to the queue configured first.
        let mut best = 0;
        for (idx, slot) in self.slots.iter().enumerate().skip(1) {
            if slot.score > self.slots[best].score {
                best = idx;
            }
        }

        self.slots[best].score -= self.total;
        best
    }

    /// Pick the next queue.
    pub fn next(&mut self) -> &str {
        let idx = self.advance();
        &self.slots[idx].name
    }

    /// The queue to poll first this round, followed by every other queue in
    /// configuration order as fallbacks for when the first one is empty.
    pub fn next_round(&mut self) -> impl Iterator<Item = &str> + '_ {
        let first = self.advance();
        let this = &*self;
        std::iter::once(first)
            .chain((0..this.slots.len()).filter(move |&i| i != first))
            .map(move |i| this.slots[i].name.as_str())
    }
}
