//! Dynamic priority scoring.
//!
//! ```text
//! score = priority * leverage
//!       + (deps satisfied ? 10 : -1000)
//!       - 0.1 * minutes queued
//!       + (!context_gathered && context_ratio > threshold ? 5 : 0)
//! ```
//!
//! The blocked penalty dominates every other term, so an unblocked task
//! always outranks a blocked one.

use crate::core::{Leverage, Priority};

pub const SATISFIED_BONUS: f64 = 10.0;
pub const BLOCKED_PENALTY: f64 = 1000.0;
pub const DECAY_PER_MINUTE: f64 = 0.1;
pub const CONTEXT_BACKLOG_BONUS: f64 = 5.0;

/// Everything the scorer looks at for one entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput {
    pub priority: Priority,
    pub leverage: Leverage,
    pub context_gathered: bool,
    pub dependencies_satisfied: bool,
    pub minutes_queued: f64,
    pub context_ratio: f64,
}

pub fn score(input: &ScoreInput, context_threshold: f64) -> f64 {
    let base = f64::from(input.priority.value()) * f64::from(input.leverage.value());
    let mut score = base;
    if input.dependencies_satisfied {
        score += SATISFIED_BONUS;
    } else {
        score -= BLOCKED_PENALTY;
    }
    score -= input.minutes_queued.max(0.0) * DECAY_PER_MINUTE;
    if !input.context_gathered && input.context_ratio > context_threshold {
        score += CONTEXT_BACKLOG_BONUS;
    }
    score
}

/// Fraction of queued tasks sitting in the context queue; `None` when both
/// queues are empty.
pub fn context_ratio(context_len: usize, implementation_len: usize) -> Option<f64> {
    let total = context_len + implementation_len;
    if total == 0 {
        None
    } else {
        Some(context_len as f64 / total as f64)
    }
}
