//! Rotating access-code engine
//!
//! Hands out one active code per page, rotates it once a day after a cutoff
//! hour, and returns consumed codes to the pool after a cool-down. The pool
//! document lives in a `code_store::DocumentStore`; every operation is a full
//! read-modify-write of that document.
//!
//! Code lifecycle:
//! 1. Provisioned via admin API or external tool → `available`
//! 2. Page requests a code and has none fresh → random draw, code recorded in
//!    `used` (cool-down starts today) and as the page's active code
//! 3. Same page asks again before the cutoff → same code, `use_count` + 1
//! 4. First request after the cutoff on a later day → new draw
//! 5. Cool-down older than `wait_days` → code back in `available`, checked
//!    inline on every request and optionally by a background sweep

pub mod chooser;
pub mod clock;
pub mod error;
pub mod rotator;
pub mod rules;
pub mod sweep;

pub use chooser::{CodeChooser, FixedChooser, RandomChooser};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use rotator::{CodeRotator, PageStatus, PoolStatus, ProvisionReport, ServedCode};
pub use rules::{ExhaustionPolicy, RotationPolicy, is_fresh};
pub use sweep::spawn_sweep_task;
