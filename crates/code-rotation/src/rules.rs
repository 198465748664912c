//! Rotation rules applied to the pool document
//!
//! Pure functions over `CodePool`: no I/O, no clock reads. The rotator loads
//! the document, applies these, and writes it back.

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use code_store::{ActiveAssignment, CodePool, PageId, UsedCode};
use serde::Deserialize;

use crate::chooser::CodeChooser;

/// What to do when a page's code has gone stale and nothing is available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustionPolicy {
    /// Report exhaustion. The stale assignment stays in the document, so it
    /// still verifies until a fresh code is drawn.
    #[default]
    Fail,
    /// Keep serving the stale code until codes are available again.
    ServeStale,
}

/// Tunables for rotation and recycling.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Pages `1..=pages` are valid
    pub pages: u8,
    /// Local hour from which a code drawn on an earlier day is stale
    pub cutoff_hour: u32,
    /// Cool-down length in days
    pub wait_days: i64,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            pages: 4,
            cutoff_hour: 1,
            wait_days: 20,
            exhaustion: ExhaustionPolicy::Fail,
        }
    }
}

/// Whether a code drawn at `assigned_at` may still be served at `now`.
///
/// Stale only once both hold: the calendar day has moved past the day of
/// assignment, and the local hour has reached `cutoff_hour`. A code drawn at
/// 23:00 therefore still serves at 00:30 the next day.
pub fn is_fresh(assigned_at: NaiveDateTime, now: NaiveDateTime, cutoff_hour: u32) -> bool {
    !(now.date() > assigned_at.date() && now.hour() >= cutoff_hour)
}

/// Move cooled-down codes back to `available`.
///
/// An entry is released when `consumed_on < today - wait_days`. A code that
/// is still a fresh assignment at `now` stays in `used` until its page rotates
/// away from it. A page whose stale assignment holds a released code is
/// cleared, so the code is never both available and active. Returns the
/// released codes.
pub fn recycle_expired(
    pool: &mut CodePool,
    now: NaiveDateTime,
    policy: &RotationPolicy,
) -> Vec<String> {
    // A window past chrono's range reaches back before any stored date
    let Some(limit) = TimeDelta::try_days(policy.wait_days)
        .and_then(|window| now.date().checked_sub_signed(window))
    else {
        return Vec::new();
    };

    let held_fresh: Vec<String> = pool
        .active
        .values()
        .filter(|a| {
            a.assigned_at
                .is_some_and(|at| is_fresh(at, now, policy.cutoff_hour))
        })
        .filter_map(|a| a.current().map(str::to_owned))
        .collect();

    let mut released = Vec::new();
    pool.used.retain(|entry| {
        if entry.consumed_on < limit && !held_fresh.contains(&entry.code) {
            released.push(entry.code.clone());
            false
        } else {
            true
        }
    });

    for assignment in pool.active.values_mut() {
        if assignment
            .current()
            .is_some_and(|code| released.iter().any(|r| r == code))
        {
            *assignment = ActiveAssignment::default();
        }
    }
    pool.available.extend(released.iter().cloned());
    released
}

/// Draw a new code for `page`.
///
/// Removes a chosen code from `available`, starts its cool-down today, and
/// makes it the page's active code with `use_count` 1. Returns `None` when
/// nothing is available, leaving the document untouched.
///
/// The outgoing code normally sits in `used` already (it was recorded there
/// when drawn). If it was edited out, it is put back with its assignment day
/// so the code is not lost from the pool.
pub fn draw(
    pool: &mut CodePool,
    page: PageId,
    now: NaiveDateTime,
    chooser: &dyn CodeChooser,
) -> Option<String> {
    let len = pool.available.len();
    if len == 0 {
        return None;
    }
    let index = chooser.choose(len).min(len - 1);
    let code = pool.available.iter().nth(index).cloned()?;
    pool.available.remove(&code);

    if let Some(outgoing) = pool.active.get(&page) {
        if let Some(old) = outgoing.current() {
            let tracked = pool.used.iter().any(|u| u.code == old) || pool.available.contains(old);
            if !tracked {
                pool.used.push(UsedCode {
                    code: old.to_owned(),
                    consumed_on: outgoing.assigned_at.map_or(now.date(), |t| t.date()),
                });
            }
        }
    }

    pool.used.push(UsedCode {
        code: code.clone(),
        consumed_on: now.date(),
    });
    pool.active.insert(
        page,
        ActiveAssignment {
            code: Some(code.clone()),
            assigned_at: Some(now),
            last_used_at: Some(now),
            use_count: 1,
        },
    );
    Some(code)
}
