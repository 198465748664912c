//! Random source for code draws

use rand::RngExt;

/// Picks an index in `0..len`. Only called with `len > 0`.
pub trait CodeChooser: Send + Sync {
    fn choose(&self, len: usize) -> usize;
}

/// Uniform choice from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomChooser;

impl CodeChooser for RandomChooser {
    fn choose(&self, len: usize) -> usize {
        rand::rng().random_range(0..len)
    }
}

/// Always picks the same position (clamped to the last element).
///
/// Makes draws deterministic; `FixedChooser(0)` takes the lexicographically
/// smallest available code.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedChooser(pub usize);

impl CodeChooser for FixedChooser {
    fn choose(&self, len: usize) -> usize {
        self.0.min(len.saturating_sub(1))
    }
}
