//! The code pool document
//!
//! A code moves through three places: `available` (free to draw), `used`
//! (cool-down list, stamped with the day its cool-down began) and the
//! per-page `active` assignment. A drawn code is recorded in `used` and as a
//! page's active code at the same time; its cool-down starts on the day it
//! was drawn, not the day it stops being served.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// 1-based identifier of a page that carries its own rotating code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(u8);

impl PageId {
    pub fn new(n: u8) -> Self {
        Self(n)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Pages `1..=count`.
    pub fn range(count: u8) -> impl Iterator<Item = PageId> {
        (1..=count).map(PageId)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A code sitting out its cool-down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedCode {
    pub code: String,
    /// Calendar day the cool-down started
    pub consumed_on: NaiveDate,
}

/// The code a page currently serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAssignment {
    pub code: Option<String>,
    /// When this code was drawn for the page
    pub assigned_at: Option<NaiveDateTime>,
    /// Last time the code was served
    pub last_used_at: Option<NaiveDateTime>,
    pub use_count: u64,
}

impl ActiveAssignment {
    /// The assigned code, treating an empty string as no code.
    pub fn current(&self) -> Option<&str> {
        self.code.as_deref().filter(|c| !c.is_empty())
    }
}

/// Informational counters, recomputed on every save. Never authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Codes ever provisioned into the pool
    pub total_issued: u64,
    pub available: usize,
    pub used: usize,
    pub updated_at: Option<NaiveDateTime>,
}

/// Singleton document holding the whole pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePool {
    /// Bumped on every successful replace
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub available: BTreeSet<String>,
    #[serde(default)]
    pub used: Vec<UsedCode>,
    #[serde(default)]
    pub active: BTreeMap<PageId, ActiveAssignment>,
    #[serde(default)]
    pub stats: PoolStats,
}

impl CodePool {
    /// Initial document: no codes, one blank assignment per page.
    pub fn empty(pages: u8, now: NaiveDateTime) -> Self {
        let mut pool = Self {
            version: 0,
            available: BTreeSet::new(),
            used: Vec::new(),
            active: PageId::range(pages)
                .map(|p| (p, ActiveAssignment::default()))
                .collect(),
            stats: PoolStats::default(),
        };
        pool.refresh_stats(now);
        pool
    }

    /// Recompute the informational counters.
    pub fn refresh_stats(&mut self, now: NaiveDateTime) {
        self.stats.available = self.available.len();
        self.stats.used = self.used.len();
        self.stats.updated_at = Some(now);
    }

    /// Every code the pool knows about, wherever it currently sits.
    pub fn distinct_codes(&self) -> BTreeSet<String> {
        let mut codes = self.available.clone();
        codes.extend(self.used.iter().map(|u| u.code.clone()));
        codes.extend(
            self.active
                .values()
                .filter_map(|a| a.current().map(str::to_owned)),
        );
        codes
    }

    /// The page currently serving `code`, if any.
    pub fn holder_of(&self, code: &str) -> Option<PageId> {
        self.active
            .iter()
            .find(|(_, a)| a.current() == Some(code))
            .map(|(page, _)| *page)
    }

    /// Whether `code` is anywhere in the pool.
    pub fn contains(&self, code: &str) -> bool {
        self.available.contains(code)
            || self.used.iter().any(|u| u.code == code)
            || self.holder_of(code).is_some()
    }

    /// Number of pages with a code assigned.
    pub fn assigned_pages(&self) -> usize {
        self.active.values().filter(|a| a.current().is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn empty_pool_has_blank_assignment_per_page() {
        let pool = CodePool::empty(4, at(1, 12));
        assert_eq!(pool.active.len(), 4);
        assert!(pool.active.values().all(|a| a.current().is_none()));
        assert_eq!(pool.stats.updated_at, Some(at(1, 12)));
        assert_eq!(pool.version, 0);
    }

    #[test]
    fn empty_string_code_counts_as_unassigned() {
        let assignment = ActiveAssignment {
            code: Some(String::new()),
            ..Default::default()
        };
        assert!(assignment.current().is_none());
    }

    #[test]
    fn distinct_codes_deduplicates_active_and_used() {
        let mut pool = CodePool::empty(2, at(1, 12));
        pool.available.insert("A".into());
        pool.used.push(UsedCode {
            code: "B".into(),
            consumed_on: at(1, 12).date(),
        });
        pool.active.get_mut(&PageId::new(1)).unwrap().code = Some("B".into());

        let codes = pool.distinct_codes();
        assert_eq!(codes.len(), 2);
        assert_eq!(pool.holder_of("B"), Some(PageId::new(1)));
        assert!(pool.contains("A"));
        assert!(!pool.contains("C"));
        assert_eq!(pool.assigned_pages(), 1);
    }

    #[test]
    fn refresh_stats_counts_lists() {
        let mut pool = CodePool::empty(1, at(1, 12));
        pool.available.insert("A".into());
        pool.available.insert("B".into());
        pool.used.push(UsedCode {
            code: "C".into(),
            consumed_on: at(1, 12).date(),
        });
        pool.refresh_stats(at(2, 8));
        assert_eq!(pool.stats.available, 2);
        assert_eq!(pool.stats.used, 1);
        assert_eq!(pool.stats.updated_at, Some(at(2, 8)));
    }

    #[test]
    fn json_shape_keys_pages_by_number() {
        let mut pool = CodePool::empty(2, at(1, 12));
        pool.active.get_mut(&PageId::new(2)).unwrap().code = Some("X".into());

        let json = serde_json::to_value(&pool).unwrap();
        assert_eq!(json["active"]["2"]["code"], "X");
        assert!(json["active"]["1"]["code"].is_null());

        let back: CodePool = serde_json::from_value(json).unwrap();
        assert_eq!(back, pool);
    }

    #[test]
    fn missing_fields_default_on_load() {
        let pool: CodePool = serde_json::from_str(r#"{"available":["A"]}"#).unwrap();
        assert_eq!(pool.version, 0);
        assert!(pool.available.contains("A"));
        assert!(pool.active.is_empty());
    }
}
