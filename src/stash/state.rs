//! Shared cache state.
//!
//! Two maps under one read-write lock: `queries` holds the cached entries
//! keyed by `(canonical_sql, params_key)`, `tables` is the reverse index
//! from a table name to every cached statement that reads it. Critical
//! sections are short map operations only — background work snapshots under
//! the read side, executes with no lock held, then re-acquires to write
//! back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::executor::{Param, ResultFormat};
use crate::rows::Rows;

/// Stable secondary cache key for a parameter vector.
pub(crate) fn params_key(params: &[Param]) -> String {
    params
        .iter()
        .map(Param::key_fragment)
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// One cached result.
pub(crate) struct Entry {
    pub(crate) result: Rows,
    pub(crate) params: Vec<Param>,
    pub(crate) format: ResultFormat,
    /// Hit counter.
    pub(crate) popularity: AtomicU64,
    /// Last-hit time, milliseconds since the cache's anchor instant.
    pub(crate) used_ms: AtomicU64,
    /// Set when a write invalidated this entry; cleared by refill.
    pub(crate) stale: Option<Instant>,
}

struct CacheData {
    queries: HashMap<String, HashMap<String, Entry>>,
    tables: HashMap<String, HashSet<String>>,
}

/// A refill unit: re-execute the statement with its stored parameters and
/// write the fresh result back.
#[derive(Clone)]
pub(crate) struct RefillJob {
    pub(crate) sql: String,
    pub(crate) key: String,
    pub(crate) params: Vec<Param>,
    pub(crate) format: ResultFormat,
}

/// Cache state shared by every Stash over the same data: the maps, the
/// launch flag, and the background tasks' shutdown signal.
pub(crate) struct CacheState {
    data: RwLock<CacheData>,
    launched: AtomicBool,
    anchor: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl CacheState {
    pub(crate) fn new() -> Self {
        Self {
            data: RwLock::new(CacheData {
                queries: HashMap::new(),
                tables: HashMap::new(),
            }),
            launched: AtomicBool::new(false),
            anchor: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown: Mutex::new(None),
        }
    }

    fn now_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    /// Claim the one-time launch. Returns false if already launched.
    pub(crate) fn mark_launched(&self) -> bool {
        self.launched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn set_shutdown(&self, tx: watch::Sender<bool>) {
        *self.shutdown.lock() = Some(tx);
    }

    /// Stop the background tasks. Idempotent.
    pub(crate) fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Fresh-hit lookup. Bumps popularity and the last-used stamp; stale
    /// entries and absences both count as misses.
    pub(crate) fn lookup(&self, sql: &str, key: &str) -> Option<Rows> {
        let data = self.data.read();
        let entry = data.queries.get(sql).and_then(|entries| entries.get(key));
        match entry {
            Some(entry) if entry.stale.is_none() => {
                entry.popularity.fetch_add(1, Ordering::Relaxed);
                entry.used_ms.store(self.now_ms(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a fresh entry and index it under every table it reads.
    pub(crate) fn insert(
        &self,
        sql: &str,
        key: String,
        result: Rows,
        params: Vec<Param>,
        format: ResultFormat,
        read_tables: &[String],
    ) {
        let entry = Entry {
            result,
            params,
            format,
            popularity: AtomicU64::new(1),
            used_ms: AtomicU64::new(self.now_ms()),
            stale: None,
        };
        let mut data = self.data.write();
        for table in read_tables {
            data.tables
                .entry(table.clone())
                .or_default()
                .insert(sql.to_string());
        }
        data.queries
            .entry(sql.to_string())
            .or_default()
            .insert(key, entry);
    }

    /// Mark every entry of every cached statement reading one of `tables`
    /// as stale. Entries stay in place (stale reads are allowed until a
    /// refill or eviction) and the table index is left intact.
    pub(crate) fn invalidate(&self, tables: &[String]) -> usize {
        let now = Instant::now();
        let mut marked = 0;
        let mut data = self.data.write();
        for table in tables {
            let sqls: Vec<String> = match data.tables.get(table) {
                Some(set) => set.iter().cloned().collect(),
                None => continue,
            };
            for sql in sqls {
                if let Some(entries) = data.queries.get_mut(&sql) {
                    for entry in entries.values_mut() {
                        entry.stale = Some(now);
                        marked += 1;
                    }
                }
            }
        }
        marked
    }

    /// Total cached entries.
    pub(crate) fn entry_count(&self) -> usize {
        self.data.read().queries.values().map(|m| m.len()).sum()
    }

    /// (entries, tables, hits, misses) for the dump line.
    pub(crate) fn stats(&self) -> (usize, usize, u64, u64) {
        let data = self.data.read();
        let entries = data.queries.values().map(|m| m.len()).sum();
        (
            entries,
            data.tables.len(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Enforce the entry cap: while over it, drop the least-recently-used
    /// entry of each query, oldest first. Returns how many were dropped.
    pub(crate) fn cap_pass(&self, cap: usize) -> usize {
        let mut dropped = 0;
        let mut data = self.data.write();
        loop {
            let total: usize = data.queries.values().map(|m| m.len()).sum();
            if total <= cap {
                break;
            }
            let mut victims: Vec<(String, String, u64)> = data
                .queries
                .iter()
                .filter_map(|(sql, entries)| {
                    entries
                        .iter()
                        .min_by_key(|(_, e)| e.used_ms.load(Ordering::Relaxed))
                        .map(|(key, e)| {
                            (sql.clone(), key.clone(), e.used_ms.load(Ordering::Relaxed))
                        })
                })
                .collect();
            if victims.is_empty() {
                break;
            }
            victims.sort_by_key(|(_, _, used)| *used);
            let mut remaining = total;
            for (sql, key, _) in victims {
                if remaining <= cap {
                    break;
                }
                let emptied = match data.queries.get_mut(&sql) {
                    Some(entries) => {
                        if entries.remove(&key).is_some() {
                            remaining -= 1;
                            dropped += 1;
                        }
                        entries.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    data.queries.remove(&sql);
                    unlink_tables(&mut data.tables, &sql);
                }
            }
        }
        dropped
    }

    /// Drop entries not used for longer than `retire_after`.
    pub(crate) fn retire_pass(&self, retire_after: Duration) -> usize {
        let cutoff = self
            .now_ms()
            .saturating_sub(retire_after.as_millis() as u64);
        let mut dropped = 0;
        let mut emptied = Vec::new();
        let mut data = self.data.write();
        for (sql, entries) in data.queries.iter_mut() {
            let before = entries.len();
            entries.retain(|_, entry| entry.used_ms.load(Ordering::Relaxed) >= cutoff);
            dropped += before - entries.len();
            if entries.is_empty() {
                emptied.push(sql.clone());
            }
        }
        for sql in emptied {
            data.queries.remove(&sql);
            unlink_tables(&mut data.tables, &sql);
        }
        dropped
    }

    /// Snapshot the stale entries whose invalidation happened at least
    /// `delay` ago, most popular queries first. Read lock only; the caller
    /// executes the jobs with no lock held.
    pub(crate) fn stale_jobs(&self, delay: Duration) -> Vec<RefillJob> {
        let data = self.data.read();
        let mut by_query: Vec<(u64, Vec<RefillJob>)> = Vec::new();
        for (sql, entries) in data.queries.iter() {
            let mut jobs = Vec::new();
            for (key, entry) in entries.iter() {
                if let Some(since) = entry.stale {
                    if since.elapsed() >= delay {
                        jobs.push(RefillJob {
                            sql: sql.clone(),
                            key: key.clone(),
                            params: entry.params.clone(),
                            format: entry.format,
                        });
                    }
                }
            }
            if !jobs.is_empty() {
                let popularity = entries
                    .values()
                    .map(|e| e.popularity.load(Ordering::Relaxed))
                    .sum();
                by_query.push((popularity, jobs));
            }
        }
        by_query.sort_by(|a, b| b.0.cmp(&a.0));
        by_query.into_iter().flat_map(|(_, jobs)| jobs).collect()
    }

    /// Write a refill result back: replace the rows and clear staleness.
    /// The entry may have been evicted in the meantime; that is fine.
    pub(crate) fn complete_refill(&self, sql: &str, key: &str, result: Rows) {
        let mut data = self.data.write();
        if let Some(entry) = data.queries.get_mut(sql).and_then(|m| m.get_mut(key)) {
            entry.result = result;
            entry.stale = None;
        }
    }
}

fn unlink_tables(tables: &mut HashMap<String, HashSet<String>>, sql: &str) {
    tables.retain(|_, sqls| {
        sqls.remove(sql);
        !sqls.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(tag: &str) -> Rows {
        Rows::from_raw(
            vec!["v".to_string()],
            vec![vec![Some(tag.as_bytes().to_vec())]],
        )
    }

    fn seed(state: &CacheState, sql: &str, key: &str, tag: &str, tables: &[&str]) {
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        state.insert(
            sql,
            key.to_string(),
            rows(tag),
            Vec::new(),
            ResultFormat::Text,
            &tables,
        );
    }

    #[test]
    fn hits_return_the_same_rows_handle() {
        let state = CacheState::new();
        seed(&state, "SELECT count(*) FROM book", "", "1", &["book"]);
        let first = state.lookup("SELECT count(*) FROM book", "").unwrap();
        let second = state.lookup("SELECT count(*) FROM book", "").unwrap();
        assert!(Rows::ptr_eq(&first, &second));
    }

    #[test]
    fn invalidation_marks_without_removing() {
        let state = CacheState::new();
        seed(&state, "SELECT * FROM book", "", "a", &["book"]);
        seed(&state, "SELECT * FROM author", "", "b", &["author"]);
        let marked = state.invalidate(&["book".to_string()]);
        assert_eq!(marked, 1);
        // Stale entries miss, but stay resident until refilled or evicted.
        assert!(state.lookup("SELECT * FROM book", "").is_none());
        assert_eq!(state.entry_count(), 2);
        assert!(state.lookup("SELECT * FROM author", "").is_some());
    }

    #[test]
    fn refill_restores_freshness_with_new_rows() {
        let state = CacheState::new();
        seed(&state, "SELECT * FROM book", "", "old", &["book"]);
        state.invalidate(&["book".to_string()]);
        let jobs = state.stale_jobs(Duration::ZERO);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].sql, "SELECT * FROM book");
        state.complete_refill("SELECT * FROM book", "", rows("new"));
        let hit = state.lookup("SELECT * FROM book", "").unwrap();
        assert_eq!(hit.get(0).unwrap().get_str(0), Some("new"));
    }

    #[test]
    fn cap_pass_drops_least_recently_used_first() {
        let state = CacheState::new();
        seed(&state, "SELECT * FROM book WHERE id = $1", "i:1", "a", &["book"]);
        seed(&state, "SELECT * FROM book WHERE id = $1", "i:2", "b", &["book"]);
        seed(&state, "SELECT * FROM author", "", "c", &["author"]);
        // Touch one key so the other is the oldest.
        std::thread::sleep(Duration::from_millis(5));
        state.lookup("SELECT * FROM book WHERE id = $1", "i:2");

        let dropped = state.cap_pass(2);
        assert_eq!(dropped, 1);
        assert_eq!(state.entry_count(), 2);
        assert!(state.lookup("SELECT * FROM book WHERE id = $1", "i:2").is_some());

        // Capping to zero clears everything including the table index.
        state.cap_pass(0);
        assert_eq!(state.entry_count(), 0);
        let (_, tables, _, _) = state.stats();
        assert_eq!(tables, 0);
    }

    #[test]
    fn retire_pass_drops_idle_entries() {
        let state = CacheState::new();
        seed(&state, "SELECT * FROM book", "", "a", &["book"]);
        std::thread::sleep(Duration::from_millis(10));
        seed(&state, "SELECT * FROM author", "", "b", &["author"]);
        let dropped = state.retire_pass(Duration::from_millis(8));
        assert_eq!(dropped, 1);
        assert!(state.lookup("SELECT * FROM book", "").is_none());
        assert!(state.lookup("SELECT * FROM author", "").is_some());
    }

    #[test]
    fn launch_claim_is_one_shot() {
        let state = CacheState::new();
        assert!(state.mark_launched());
        assert!(!state.mark_launched());
    }

    #[test]
    fn refill_delay_filters_recent_invalidations() {
        let state = CacheState::new();
        seed(&state, "SELECT * FROM book", "", "a", &["book"]);
        state.invalidate(&["book".to_string()]);
        assert!(state.stale_jobs(Duration::from_secs(60)).is_empty());
        assert_eq!(state.stale_jobs(Duration::ZERO).len(), 1);
    }
}
