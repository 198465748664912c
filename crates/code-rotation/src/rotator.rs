//! The code rotation engine
//!
//! `CodeRotator` owns the read-modify-write cycle against the pool document.
//! A tokio Mutex serializes writers inside this process so two requests for
//! the same page cannot both draw; the store's version check rejects writes
//! from a process that raced us, and that rejection is reported as
//! `StoreUnavailable` without retrying.

use std::sync::Arc;

use chrono::NaiveDateTime;
use code_store::{ActiveAssignment, CodePool, DocumentStore, PageId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chooser::{CodeChooser, RandomChooser};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::rules::{self, ExhaustionPolicy, RotationPolicy};

/// A code handed to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServedCode {
    pub code: String,
    pub use_count: u64,
    /// True when this call drew a new code
    pub rotated: bool,
}

/// Outcome of adding codes to the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub added: usize,
    /// Blank codes and codes already somewhere in the pool
    pub skipped: usize,
}

/// One page's assignment as reported by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct PageStatus {
    pub page: PageId,
    pub code: Option<String>,
    pub assigned_at: Option<NaiveDateTime>,
    pub last_used_at: Option<NaiveDateTime>,
    pub use_count: u64,
    pub fresh: bool,
}

/// Pool summary for health and admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub status: &'static str,
    pub initialized: bool,
    pub codes_total: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub pages_assigned: usize,
    pub total_issued: u64,
    pub updated_at: Option<NaiveDateTime>,
    pub pages: Vec<PageStatus>,
}

/// Rotating-code engine over a document store.
pub struct CodeRotator {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    chooser: Arc<dyn CodeChooser>,
    policy: RotationPolicy,
    write_lock: Mutex<()>,
}

impl CodeRotator {
    /// Create an engine using the local system clock and uniform random draws.
    pub fn new(store: Arc<dyn DocumentStore>, policy: RotationPolicy) -> Self {
        info!(
            store = store.id(),
            pages = policy.pages,
            cutoff_hour = policy.cutoff_hour,
            wait_days = policy.wait_days,
            exhaustion = ?policy.exhaustion,
            "code rotator initialized"
        );
        Self {
            store,
            clock: Arc::new(SystemClock),
            chooser: Arc::new(RandomChooser),
            policy,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_chooser(mut self, chooser: Arc<dyn CodeChooser>) -> Self {
        self.chooser = chooser;
        self
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    pub fn store_id(&self) -> &str {
        self.store.id()
    }

    /// Validate a raw page number against the configured page count.
    pub fn page(&self, n: u32) -> Result<PageId> {
        u8::try_from(n)
            .ok()
            .filter(|n| (1..=self.policy.pages).contains(n))
            .map(PageId::new)
            .ok_or(Error::UnknownPage(n))
    }

    /// Create the pool document if it does not exist, and add blank
    /// assignments for any configured page the document lacks.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let existing = self.store.load().await.map_err(store_failure)?;
        let created = existing.is_none();
        let mut pool = existing.unwrap_or_else(|| CodePool::empty(self.policy.pages, now));
        let pages_added = self.add_missing_pages(&mut pool);

        if created || pages_added > 0 {
            self.commit(pool, now).await?;
            info!(created, pages_added, "code pool document initialized");
        }
        Ok(())
    }

    /// Return the page's current code, drawing a new one when the current
    /// assignment is missing or past its daily cutoff.
    ///
    /// Cooled-down codes are recycled first on every call. Re-serving a fresh
    /// code bumps `use_count` and `last_used_at`; a new draw resets
    /// `use_count` to 1. Returns `PoolExhausted` when a draw is needed and
    /// nothing is available, unless the policy says to keep serving the
    /// stale code.
    pub async fn active_code(&self, page: PageId) -> Result<ServedCode> {
        self.check_page(page)?;
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let mut pool = self.load_or_empty(now).await?;

        let recycled = rules::recycle_expired(&mut pool, now, &self.policy).len();

        let assignment = pool.active.entry(page).or_default();
        let current = assignment.current().map(str::to_owned);

        if let (Some(code), Some(assigned_at)) = (current.clone(), assignment.assigned_at) {
            if rules::is_fresh(assigned_at, now, self.policy.cutoff_hour) {
                let use_count = touch(assignment, now);
                self.commit(pool, now).await?;
                record_recycled(recycled);
                debug!(page = %page, use_count, "serving active code");
                return Ok(ServedCode {
                    code,
                    use_count,
                    rotated: false,
                });
            }
        }

        if let Some(code) = rules::draw(&mut pool, page, now, self.chooser.as_ref()) {
            self.commit(pool, now).await?;
            record_recycled(recycled);
            metrics::counter!("code_rotations_total", "page" => page.to_string()).increment(1);
            info!(page = %page, replaced = current.is_some(), "drew new code for page");
            return Ok(ServedCode {
                code,
                use_count: 1,
                rotated: true,
            });
        }

        match (self.policy.exhaustion, current) {
            (ExhaustionPolicy::ServeStale, Some(code)) => {
                let use_count = pool
                    .active
                    .get_mut(&page)
                    .map(|a| touch(a, now))
                    .unwrap_or(1);
                self.commit(pool, now).await?;
                record_recycled(recycled);
                warn!(page = %page, use_count, "no codes available, still serving stale code");
                Ok(ServedCode {
                    code,
                    use_count,
                    rotated: false,
                })
            }
            _ => {
                warn!(page = %page, "no codes available");
                Err(Error::PoolExhausted(page))
            }
        }
    }

    /// Return every cooled-down code to `available`. Returns how many moved.
    pub async fn recycle_expired(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let Some(mut pool) = self.store.load().await.map_err(store_failure)? else {
            return Ok(0);
        };

        let released = rules::recycle_expired(&mut pool, now, &self.policy);
        if released.is_empty() {
            return Ok(0);
        }
        self.commit(pool, now).await?;
        record_recycled(released.len());
        Ok(released.len())
    }

    /// Whether `code` is the page's active code. Read-only: no recycling,
    /// no usage bookkeeping.
    pub async fn is_code_valid(&self, code: &str, page: PageId) -> Result<bool> {
        self.check_page(page)?;
        if code.is_empty() {
            return Ok(false);
        }
        let pool = self.store.load().await.map_err(store_failure)?;
        Ok(pool
            .as_ref()
            .and_then(|p| p.active.get(&page))
            .and_then(ActiveAssignment::current)
            .is_some_and(|active| active == code))
    }

    /// Add codes to `available`. Blank codes and codes already present
    /// anywhere in the pool are skipped.
    pub async fn provision<I>(&self, codes: I) -> Result<ProvisionReport>
    where
        I: IntoIterator<Item = String>,
    {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let mut pool = self.load_or_empty(now).await?;

        let mut report = ProvisionReport::default();
        for code in codes {
            let code = code.trim().to_owned();
            if code.is_empty() || pool.contains(&code) {
                report.skipped += 1;
                continue;
            }
            pool.available.insert(code);
            report.added += 1;
        }

        if report.added > 0 {
            pool.stats.total_issued += report.added as u64;
            self.commit(pool, now).await?;
        }
        info!(
            added = report.added,
            skipped = report.skipped,
            "provisioned codes"
        );
        Ok(report)
    }

    /// Remove a code from the pool entirely. A page serving it is left with
    /// no code and draws on its next request. Returns whether it was found.
    pub async fn retire(&self, code: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let Some(mut pool) = self.store.load().await.map_err(store_failure)? else {
            return Ok(false);
        };

        let mut found = pool.available.remove(code);
        let used_before = pool.used.len();
        pool.used.retain(|u| u.code != code);
        found |= pool.used.len() != used_before;
        for (page, assignment) in pool.active.iter_mut() {
            if assignment.current() == Some(code) {
                info!(page = %page, "retired code was active, clearing page");
                *assignment = ActiveAssignment::default();
                found = true;
            }
        }

        if found {
            self.commit(pool, now).await?;
            info!("code retired");
        }
        Ok(found)
    }

    /// Snapshot of pool counts and page assignments.
    pub async fn status(&self) -> Result<PoolStatus> {
        let now = self.clock.now();
        let loaded = self.store.load().await.map_err(store_failure)?;
        let initialized = loaded.is_some();
        let mut pool = loaded.unwrap_or_else(|| CodePool::empty(self.policy.pages, now));
        self.add_missing_pages(&mut pool);

        let pages: Vec<PageStatus> = PageId::range(self.policy.pages)
            .map(|page| {
                let a = pool.active.get(&page).cloned().unwrap_or_default();
                let fresh = a.current().is_some()
                    && a
                        .assigned_at
                        .is_some_and(|at| rules::is_fresh(at, now, self.policy.cutoff_hour));
                PageStatus {
                    page,
                    code: a.current().map(str::to_owned),
                    assigned_at: a.assigned_at,
                    last_used_at: a.last_used_at,
                    use_count: a.use_count,
                    fresh,
                }
            })
            .collect();

        let available = pool.available.len();
        let pages_assigned = pool.assigned_pages();
        let status = if available > 0 {
            "healthy"
        } else if pages_assigned > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        Ok(PoolStatus {
            status,
            initialized,
            codes_total: pool.distinct_codes().len(),
            available,
            cooling_down: pool.used.len(),
            pages_assigned,
            total_issued: pool.stats.total_issued,
            updated_at: pool.stats.updated_at,
            pages,
        })
    }

    fn check_page(&self, page: PageId) -> Result<()> {
        self.page(page.get().into()).map(|_| ())
    }

    fn add_missing_pages(&self, pool: &mut CodePool) -> usize {
        let mut added = 0;
        for page in PageId::range(self.policy.pages) {
            if !pool.active.contains_key(&page) {
                pool.active.insert(page, ActiveAssignment::default());
                added += 1;
            }
        }
        added
    }

    async fn load_or_empty(&self, now: NaiveDateTime) -> Result<CodePool> {
        let mut pool = self
            .store
            .load()
            .await
            .map_err(store_failure)?
            .unwrap_or_else(|| CodePool::empty(self.policy.pages, now));
        self.add_missing_pages(&mut pool);
        Ok(pool)
    }

    /// Stamp the next version, refresh stats and replace the document.
    async fn commit(&self, mut pool: CodePool, now: NaiveDateTime) -> Result<()> {
        let expected = pool.version;
        pool.version = expected + 1;
        pool.refresh_stats(now);
        self.store
            .replace(expected, &pool)
            .await
            .map_err(store_failure)?;
        metrics::gauge!("codes_available").set(pool.available.len() as f64);
        metrics::gauge!("codes_cooling_down").set(pool.used.len() as f64);
        Ok(())
    }
}

fn touch(assignment: &mut ActiveAssignment, now: NaiveDateTime) -> u64 {
    assignment.last_used_at = Some(now);
    assignment.use_count += 1;
    assignment.use_count
}

fn record_recycled(count: usize) {
    if count > 0 {
        info!(count, "recycled cooled-down codes");
        metrics::counter!("codes_recycled_total").increment(count as u64);
    }
}

fn store_failure(e: code_store::Error) -> Error {
    warn!(error = %e, "code store operation failed");
    Error::StoreUnavailable(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chooser::FixedChooser;
    use crate::clock::ManualClock;
    use chrono::{NaiveDate, TimeDelta};
    use code_store::{MemoryStore, UsedCode};
    use std::future::Future;
    use std::pin::Pin;

    /// Store that fails every call.
    struct OfflineStore;

    impl DocumentStore for OfflineStore {
        fn id(&self) -> &str {
            "offline"
        }

        fn load(
            &self,
        ) -> Pin<Box<dyn Future<Output = code_store::Result<Option<CodePool>>> + Send + '_>>
        {
            Box::pin(async { Err(code_store::Error::Io("store offline".into())) })
        }

        fn replace<'a>(
            &'a self,
            _expected_version: u64,
            _pool: &'a CodePool,
        ) -> Pin<Box<dyn Future<Output = code_store::Result<()>> + Send + 'a>> {
            Box::pin(async { Err(code_store::Error::Io("store offline".into())) })
        }
    }

    /// Store whose writes always lose the version race.
    struct RacedStore(MemoryStore);

    impl DocumentStore for RacedStore {
        fn id(&self) -> &str {
            "raced"
        }

        fn load(
            &self,
        ) -> Pin<Box<dyn Future<Output = code_store::Result<Option<CodePool>>> + Send + '_>>
        {
            self.0.load()
        }

        fn replace<'a>(
            &'a self,
            expected_version: u64,
            _pool: &'a CodePool,
        ) -> Pin<Box<dyn Future<Output = code_store::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                Err(code_store::Error::Conflict {
                    expected: expected_version,
                    found: expected_version + 1,
                })
            })
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn page(n: u8) -> PageId {
        PageId::new(n)
    }

    struct Harness {
        rotator: Arc<CodeRotator>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    async fn harness(codes: &[&str], policy: RotationPolicy) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(at(10, 9, 0)));
        let rotator = CodeRotator::new(store.clone(), policy)
            .with_clock(clock.clone())
            .with_chooser(Arc::new(FixedChooser(0)));
        rotator.ensure_initialized().await.unwrap();
        rotator
            .provision(codes.iter().map(|c| c.to_string()))
            .await
            .unwrap();
        Harness {
            rotator: Arc::new(rotator),
            store,
            clock,
        }
    }

    async fn document(store: &MemoryStore) -> CodePool {
        store.load().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn first_request_draws_and_second_reuses() {
        let h = harness(&["A1", "A2"], RotationPolicy::default()).await;

        let first = h.rotator.active_code(page(1)).await.unwrap();
        assert_eq!(first.code, "A1");
        assert_eq!(first.use_count, 1);
        assert!(first.rotated);

        let pool = document(&h.store).await;
        assert_eq!(pool.available.len(), 1);
        assert!(pool.available.contains("A2"));
        assert_eq!(
            pool.used,
            vec![UsedCode {
                code: "A1".into(),
                consumed_on: at(10, 0, 0).date()
            }]
        );
        assert_eq!(pool.active[&page(1)].current(), Some("A1"));
        assert_eq!(pool.active[&page(1)].use_count, 1);

        h.clock.advance(TimeDelta::hours(3));
        let second = h.rotator.active_code(page(1)).await.unwrap();
        assert_eq!(second.code, "A1");
        assert_eq!(second.use_count, 2);
        assert!(!second.rotated);

        let pool = document(&h.store).await;
        assert_eq!(pool.active[&page(1)].last_used_at, Some(at(10, 12, 0)));
        assert_eq!(pool.active[&page(1)].assigned_at, Some(at(10, 9, 0)));
    }

    #[tokio::test]
    async fn repeated_calls_same_day_increment_by_one() {
        let h = harness(&["A", "B", "C"], RotationPolicy::default()).await;
        for expected in 1..=5u64 {
            let served = h.rotator.active_code(page(2)).await.unwrap();
            assert_eq!(served.code, "A");
            assert_eq!(served.use_count, expected);
            h.clock.advance(TimeDelta::minutes(30));
        }
    }

    #[tokio::test]
    async fn pages_hold_independent_codes() {
        let h = harness(&["A", "B", "C", "D"], RotationPolicy::default()).await;
        let mut seen = Vec::new();
        for n in 1..=4 {
            seen.push(h.rotator.active_code(page(n)).await.unwrap().code);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4, "each page draws a distinct code");
        assert!(document(&h.store).await.available.is_empty());
    }

    #[tokio::test]
    async fn rotation_waits_for_cutoff_hour_next_day() {
        let h = harness(&["A", "B"], RotationPolicy::default()).await;
        h.clock.set(at(10, 23, 0));
        assert_eq!(h.rotator.active_code(page(1)).await.unwrap().code, "A");

        h.clock.set(at(11, 0, 30));
        let grace = h.rotator.active_code(page(1)).await.unwrap();
        assert_eq!(grace.code, "A");
        assert!(!grace.rotated);

        h.clock.set(at(11, 1, 0));
        let rotated = h.rotator.active_code(page(1)).await.unwrap();
        assert_eq!(rotated.code, "B");
        assert_eq!(rotated.use_count, 1);
        assert!(rotated.rotated);

        // The old code stays in cool-down, not back in available
        let pool = document(&h.store).await;
        assert!(pool.used.iter().any(|u| u.code == "A"));
        assert!(!pool.available.contains("A"));
    }

    #[tokio::test]
    async fn exhausted_pool_reports_exhaustion() {
        let h = harness(&[], RotationPolicy::default()).await;
        let err = h.rotator.active_code(page(1)).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(p) if p == page(1)));
    }

    #[tokio::test]
    async fn exhaustion_at_rotation_fails_but_stale_code_still_verifies() {
        let h = harness(&["ONLY"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap();
        let before = document(&h.store).await;

        h.clock.set(at(11, 2, 0));
        let err = h.rotator.active_code(page(1)).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));

        // Nothing was written
        assert_eq!(document(&h.store).await, before);
        assert!(h.rotator.is_code_valid("ONLY", page(1)).await.unwrap());
    }

    #[tokio::test]
    async fn serve_stale_policy_keeps_old_code_when_exhausted() {
        let policy = RotationPolicy {
            exhaustion: ExhaustionPolicy::ServeStale,
            ..Default::default()
        };
        let h = harness(&["ONLY"], policy).await;
        h.rotator.active_code(page(1)).await.unwrap();

        h.clock.set(at(11, 2, 0));
        let served = h.rotator.active_code(page(1)).await.unwrap();
        assert_eq!(served.code, "ONLY");
        assert_eq!(served.use_count, 2);
        assert!(!served.rotated);

        // Once a code shows up the page rotates
        h.rotator.provision(vec!["NEW".to_string()]).await.unwrap();
        let rotated = h.rotator.active_code(page(1)).await.unwrap();
        assert_eq!(rotated.code, "NEW");
        assert!(rotated.rotated);
    }

    #[tokio::test]
    async fn consumed_code_returns_after_wait_days() {
        let h = harness(&["A", "B"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap(); // A on March 10

        h.clock.set(at(11, 9, 0));
        assert_eq!(h.rotator.active_code(page(1)).await.unwrap().code, "B");

        // March 30 is today - 20 = March 10: not yet released
        h.clock.set(at(30, 9, 0));
        assert_eq!(h.rotator.recycle_expired().await.unwrap(), 0);
        assert!(!document(&h.store).await.available.contains("A"));

        // March 31: March 10 < March 11, released
        h.clock.set(at(31, 9, 0));
        assert_eq!(h.rotator.recycle_expired().await.unwrap(), 1);
        let pool = document(&h.store).await;
        assert!(pool.available.contains("A"));
        assert!(pool.used.iter().all(|u| u.code != "A"));
    }

    #[tokio::test]
    async fn exhausted_page_recovers_once_its_code_cools_down() {
        let h = harness(&["ONLY"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap(); // March 10

        h.clock.set(at(11, 2, 0));
        assert!(matches!(
            h.rotator.active_code(page(1)).await,
            Err(Error::PoolExhausted(_))
        ));

        // March 31: the held code finished its cool-down and is drawn again
        h.clock.set(at(31, 9, 0));
        let served = h.rotator.active_code(page(1)).await.unwrap();
        assert_eq!(served.code, "ONLY");
        assert_eq!(served.use_count, 1);
        assert!(served.rotated);

        let pool = document(&h.store).await;
        assert!(pool.available.is_empty());
        assert_eq!(
            pool.used,
            vec![UsedCode {
                code: "ONLY".into(),
                consumed_on: at(31, 0, 0).date()
            }]
        );
    }

    #[tokio::test]
    async fn every_page_redraws_after_a_long_quiet_spell() {
        let h = harness(&["A", "B", "C", "D"], RotationPolicy::default()).await;
        for n in 1..=4 {
            h.rotator.active_code(page(n)).await.unwrap();
        }

        h.clock.advance(TimeDelta::days(25));
        let mut codes = Vec::new();
        for n in 1..=4 {
            let served = h.rotator.active_code(page(n)).await.unwrap();
            assert!(served.rotated);
            codes.push(served.code);
        }
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 4);
        assert_eq!(document(&h.store).await.distinct_codes().len(), 4);
    }

    #[tokio::test]
    async fn recycle_releases_cooled_code_held_by_stale_page() {
        let h = harness(&["A"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap();

        h.clock.set(at(31, 9, 0));
        assert_eq!(h.rotator.recycle_expired().await.unwrap(), 1);

        let pool = document(&h.store).await;
        assert!(pool.available.contains("A"));
        assert!(pool.used.is_empty());
        assert!(pool.holder_of("A").is_none());
        assert!(!h.rotator.is_code_valid("A", page(1)).await.unwrap());
    }

    #[tokio::test]
    async fn active_code_recycles_inline() {
        let h = harness(&["A"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap(); // A on page 1

        // Page 2 has nothing to draw
        assert!(h.rotator.active_code(page(2)).await.is_err());

        // An operator clears page 1 by editing the document
        let mut pool = document(&h.store).await;
        pool.active.insert(page(1), ActiveAssignment::default());
        let version = pool.version;
        pool.version += 1;
        h.store.replace(version, &pool).await.unwrap();

        h.clock.set(at(31, 9, 0));
        let served = h.rotator.active_code(page(2)).await.unwrap();
        assert_eq!(served.code, "A");
        assert!(served.rotated);
    }

    #[tokio::test]
    async fn validity_check_is_read_only() {
        let h = harness(&["A", "B"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap();
        let before = document(&h.store).await;

        // Even far in the future, no recycling or bookkeeping happens
        h.clock.set(at(31, 9, 0));
        for _ in 0..5 {
            assert!(h.rotator.is_code_valid("A", page(1)).await.unwrap());
            assert!(!h.rotator.is_code_valid("B", page(1)).await.unwrap());
            assert!(!h.rotator.is_code_valid("A", page(2)).await.unwrap());
            assert!(!h.rotator.is_code_valid("", page(1)).await.unwrap());
        }
        assert_eq!(document(&h.store).await, before);
    }

    #[tokio::test]
    async fn unknown_page_rejected_before_store_access() {
        let rotator = CodeRotator::new(Arc::new(OfflineStore), RotationPolicy::default());
        for n in [0u8, 5, 200] {
            assert!(matches!(
                rotator.active_code(page(n)).await,
                Err(Error::UnknownPage(_))
            ));
            assert!(matches!(
                rotator.is_code_valid("A", page(n)).await,
                Err(Error::UnknownPage(_))
            ));
        }
        assert!(matches!(rotator.page(1000), Err(Error::UnknownPage(1000))));
        assert_eq!(rotator.page(4).unwrap(), page(4));
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let rotator = CodeRotator::new(Arc::new(OfflineStore), RotationPolicy::default());
        assert!(matches!(
            rotator.active_code(page(1)).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            rotator.is_code_valid("A", page(1)).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            rotator.recycle_expired().await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn lost_version_race_changes_nothing() {
        let inner = MemoryStore::new();
        let mut seeded = CodePool::empty(4, at(10, 9, 0));
        seeded.available.insert("A".into());
        seeded.version = 1;
        inner.replace(0, &seeded).await.unwrap();

        let store = Arc::new(RacedStore(inner));
        let rotator = CodeRotator::new(store.clone(), RotationPolicy::default())
            .with_clock(Arc::new(ManualClock::new(at(10, 9, 0))));

        let err = rotator.active_code(page(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StoreUnavailable(code_store::Error::Conflict { .. })
        ));
        assert_eq!(store.load().await.unwrap().unwrap(), seeded);
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_page_share_a_code() {
        let h = harness(&["A", "B", "C", "D", "E"], RotationPolicy::default()).await;
        let rotator = h.rotator.clone();

        let mut handles = vec![];
        for _ in 0..10 {
            let rotator = rotator.clone();
            handles.push(tokio::spawn(async move {
                rotator.active_code(page(1)).await.unwrap().code
            }));
        }
        let mut codes = vec![];
        for handle in handles {
            codes.push(handle.await.unwrap());
        }
        codes.dedup();
        assert_eq!(codes.len(), 1, "all callers must see one code");

        let pool = document(&h.store).await;
        assert_eq!(pool.active[&page(1)].use_count, 10);
        assert_eq!(pool.available.len(), 4);
    }

    #[tokio::test]
    async fn code_count_is_conserved_over_two_months() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(at(1, 8, 0)));
        let policy = RotationPolicy {
            wait_days: 5,
            ..Default::default()
        };
        let rotator = CodeRotator::new(store.clone(), policy).with_clock(clock.clone());
        rotator
            .provision((0..40).map(|i| format!("CODE-{i:02}")))
            .await
            .unwrap();
        let total = document(&store).await.distinct_codes().len();
        assert_eq!(total, 40);

        for _ in 0..60 {
            for n in 1..=4 {
                let served = rotator.active_code(page(n)).await.unwrap();
                assert!(rotator.is_code_valid(&served.code, page(n)).await.unwrap());
            }
            clock.advance(TimeDelta::hours(13));
            rotator.recycle_expired().await.unwrap();
            clock.advance(TimeDelta::hours(11));

            let pool = document(&store).await;
            assert_eq!(pool.distinct_codes().len(), total);
            for code in &pool.available {
                assert!(pool.holder_of(code).is_none(), "{code} both available and active");
                assert!(pool.used.iter().all(|u| &u.code != code));
            }
        }
    }

    #[tokio::test]
    async fn provision_skips_duplicates_and_blanks() {
        let h = harness(&["A"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap(); // A now active + used

        let report = h
            .rotator
            .provision(vec![
                "A".to_string(),
                "B".to_string(),
                "  ".to_string(),
                " C ".to_string(),
                "B".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(report, ProvisionReport { added: 2, skipped: 3 });

        let pool = document(&h.store).await;
        assert!(pool.available.contains("B"));
        assert!(pool.available.contains("C"));
        assert_eq!(pool.stats.total_issued, 3);
    }

    #[tokio::test]
    async fn retire_removes_code_everywhere() {
        let h = harness(&["A", "B"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap();

        assert!(h.rotator.retire("A").await.unwrap());
        assert!(!h.rotator.retire("A").await.unwrap());

        let pool = document(&h.store).await;
        assert!(!pool.contains("A"));
        assert!(pool.active[&page(1)].current().is_none());
        assert!(!h.rotator.is_code_valid("A", page(1)).await.unwrap());

        // Page draws again on its next request
        assert_eq!(h.rotator.active_code(page(1)).await.unwrap().code, "B");
    }

    #[tokio::test]
    async fn ensure_initialized_creates_document_once() {
        let store = Arc::new(MemoryStore::new());
        let rotator = CodeRotator::new(store.clone(), RotationPolicy::default())
            .with_clock(Arc::new(ManualClock::new(at(1, 0, 0))));

        rotator.ensure_initialized().await.unwrap();
        let pool = document(&store).await;
        assert_eq!(pool.version, 1);
        assert_eq!(pool.active.len(), 4);

        rotator.ensure_initialized().await.unwrap();
        assert_eq!(document(&store).await.version, 1, "no rewrite when complete");
    }

    #[tokio::test]
    async fn ensure_initialized_adds_new_pages() {
        let store = Arc::new(MemoryStore::with_document(CodePool::empty(2, at(1, 0, 0))));
        let policy = RotationPolicy {
            pages: 6,
            ..Default::default()
        };
        let rotator = CodeRotator::new(store.clone(), policy);
        rotator.ensure_initialized().await.unwrap();
        assert_eq!(document(&store).await.active.len(), 6);
    }

    #[tokio::test]
    async fn status_reports_counts_and_freshness() {
        let h = harness(&["A", "B", "C"], RotationPolicy::default()).await;
        h.rotator.active_code(page(1)).await.unwrap();

        let status = h.rotator.status().await.unwrap();
        assert_eq!(status.status, "healthy");
        assert!(status.initialized);
        assert_eq!(status.codes_total, 3);
        assert_eq!(status.available, 2);
        assert_eq!(status.cooling_down, 1);
        assert_eq!(status.pages_assigned, 1);
        assert_eq!(status.total_issued, 3);
        assert_eq!(status.pages.len(), 4);
        assert!(status.pages[0].fresh);
        assert_eq!(status.pages[0].code.as_deref(), Some("A"));
        assert!(!status.pages[1].fresh);

        h.clock.set(at(11, 5, 0));
        let status = h.rotator.status().await.unwrap();
        assert!(!status.pages[0].fresh, "past cutoff on the next day");
    }

    #[tokio::test]
    async fn assignments_survive_restart_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codes.json");
        let clock = Arc::new(ManualClock::new(at(10, 9, 0)));

        let first = CodeRotator::new(
            Arc::new(code_store::JsonFileStore::open(path.clone()).await.unwrap()),
            RotationPolicy::default(),
        )
        .with_clock(clock.clone())
        .with_chooser(Arc::new(FixedChooser(1)));
        first
            .provision(vec!["A".to_string(), "B".to_string(), "C".to_string()])
            .await
            .unwrap();
        let served = first.active_code(page(2)).await.unwrap();
        assert_eq!(served.code, "B");
        drop(first);

        let second = CodeRotator::new(
            Arc::new(code_store::JsonFileStore::open(path).await.unwrap()),
            RotationPolicy::default(),
        )
        .with_clock(clock);
        let again = second.active_code(page(2)).await.unwrap();
        assert_eq!(again.code, "B");
        assert_eq!(again.use_count, 2);
        assert!(second.is_code_valid("B", page(2)).await.unwrap());
    }

    #[tokio::test]
    async fn status_serializes_for_admin_api() {
        let h = harness(&["A"], RotationPolicy::default()).await;
        h.rotator.active_code(page(4)).await.unwrap();

        let json = serde_json::to_value(h.rotator.status().await.unwrap()).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["pages"][3]["page"], 4);
        assert_eq!(json["pages"][3]["code"], "A");
        assert_eq!(json["pages"][3]["use_count"], 1);
        assert_eq!(json["pages"][3]["assigned_at"], "2026-03-10T09:00:00");
    }

    #[tokio::test]
    async fn status_without_document_is_unhealthy() {
        let rotator = CodeRotator::new(Arc::new(MemoryStore::new()), RotationPolicy::default());
        let status = rotator.status().await.unwrap();
        assert_eq!(status.status, "unhealthy");
        assert!(!status.initialized);
        assert_eq!(status.pages.len(), 4);
    }
}
