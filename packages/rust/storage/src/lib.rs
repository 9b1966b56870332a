//! Durable cache of acquired payloads.
//!
//! The [`CacheIndex`] is an append-only log of completed payload filenames
//! mirrored into an in-memory set. It is the single source of truth for
//! "already acquired" and replaces scanning the payload directory.
//!
//! **Access rules:**
//! - One [`CacheIndex`] per process owns the log file; share it via `Arc`.
//! - [`CacheIndex::append`] is the only write path and is serialized.
//! - A full directory scan only happens through [`CacheRebuilder`].

mod rebuild;
mod store;

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use gridharvest_shared::{CacheEntry, EntryFilter, HarvestError, ParsedEntry, Result};
use tracing::{debug, info, warn};

pub use rebuild::{CacheRebuilder, RebuildReport};
pub use store::{FsStore, PayloadStore};

/// Times a single log append is attempted before giving up.
const APPEND_ATTEMPTS: u32 = 3;

/// Counters collected while loading the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Non-blank lines read.
    pub lines: usize,
    /// Distinct entries loaded.
    pub entries: usize,
    /// Lines that repeated an earlier entry.
    pub duplicates: usize,
    /// Lines skipped because they are not a conforming filename.
    pub malformed: usize,
}

#[derive(Debug)]
struct IndexState {
    entries: HashSet<String>,
    log: File,
    /// The log may end in a partial line, so the next append must start with
    /// a newline.
    torn_tail: bool,
}

/// Append-only log of completed filenames plus its in-memory set.
#[derive(Debug)]
pub struct CacheIndex {
    stats: LoadStats,
    state: Mutex<IndexState>,
}

impl CacheIndex {
    /// Open the log at `log_path`, creating an empty one if it does not exist,
    /// and read it fully into memory.
    pub fn load(log_path: &Path) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
            }
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| HarvestError::io(log_path, e))?;

        let raw = std::fs::read(log_path).map_err(|e| HarvestError::io(log_path, e))?;
        let (entries, stats) = parse_log(&String::from_utf8_lossy(&raw));
        let torn_tail = !raw.is_empty() && !raw.ends_with(b"\n");
        if torn_tail {
            warn!(path = %log_path.display(), "cache log ends in a partial line");
        }

        info!(
            path = %log_path.display(),
            entries = stats.entries,
            duplicates = stats.duplicates,
            malformed = stats.malformed,
            "cache index loaded"
        );

        Ok(Self {
            stats,
            state: Mutex::new(IndexState {
                entries,
                log,
                torn_tail,
            }),
        })
    }

    /// Read the log at `log_path` without creating or writing anything.
    ///
    /// Returns `None` if the log does not exist.
    pub fn read_existing(log_path: &Path) -> Result<Option<(Vec<String>, LoadStats)>> {
        let raw = match std::fs::read(log_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HarvestError::io(log_path, e)),
        };
        let (entries, stats) = parse_log(&String::from_utf8_lossy(&raw));
        let mut entries: Vec<String> = entries.into_iter().collect();
        entries.sort_unstable();
        Ok(Some((entries, stats)))
    }

    /// Counters from the initial load.
    pub fn load_stats(&self) -> LoadStats {
        self.stats
    }

    /// Whether `entry` has been acquired.
    pub fn contains(&self, entry: &str) -> bool {
        self.lock().entries.contains(entry)
    }

    /// Record `entry` as acquired.
    ///
    /// Writes `entry + "\n"` to the log, then inserts it into the set, all under
    /// the index lock. Returns `Ok(false)` without writing if the entry is
    /// already present. The write is retried a few times; persistent failure
    /// returns [`HarvestError::DiskWrite`] and leaves the set unchanged.
    ///
    /// A partial line left by a crash or a failed attempt is terminated first,
    /// so the new entry always lands on a line of its own.
    pub fn append(&self, entry: &CacheEntry) -> Result<bool> {
        let mut state = self.lock();
        if state.entries.contains(entry.as_str()) {
            debug!(%entry, "already cached, skipping append");
            return Ok(false);
        }

        let mut attempt = 1;
        loop {
            let line = if state.torn_tail {
                format!("\n{entry}\n")
            } else {
                format!("{entry}\n")
            };
            let log = &mut state.log;
            let written = log.write_all(line.as_bytes()).and_then(|()| log.flush());
            match written {
                Ok(()) => {
                    state.torn_tail = false;
                    break;
                }
                Err(e) if attempt < APPEND_ATTEMPTS => {
                    state.torn_tail = true;
                    warn!(%entry, attempt, error = %e, "cache append failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    state.torn_tail = true;
                    return Err(HarvestError::disk_write(entry.as_str(), e));
                }
            }
        }

        state.entries.insert(entry.as_str().to_owned());
        Ok(true)
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, sorted.
    pub fn entries(&self) -> Vec<String> {
        let mut all: Vec<String> = self.lock().entries.iter().cloned().collect();
        all.sort_unstable();
        all
    }

    /// Entries matching `filter`, sorted.
    pub fn filter(&self, filter: &EntryFilter) -> Vec<CacheEntry> {
        let state = self.lock();
        let mut matched: Vec<CacheEntry> = state
            .entries
            .iter()
            .filter(|name| ParsedEntry::parse(name).is_some_and(|p| filter.matches(&p)))
            .filter_map(|name| CacheEntry::parse(name))
            .collect();
        matched.sort_unstable();
        matched
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse log content into a set, skipping blank and malformed lines.
fn parse_log(content: &str) -> (HashSet<String>, LoadStats) {
    let mut entries = HashSet::new();
    let mut stats = LoadStats::default();

    for (line_no, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        stats.lines += 1;

        if CacheEntry::parse(trimmed).is_none() {
            warn!(line = line_no + 1, content = trimmed, "skipping malformed cache line");
            stats.malformed += 1;
            continue;
        }

        if !entries.insert(trimmed.to_string()) {
            stats.duplicates += 1;
        }
    }

    stats.entries = entries.len();
    (entries, stats)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use gridharvest_shared::{Coordinate, ResourceKind, WorkItem};
    use uuid::Uuid;

    fn temp_log() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("gh-index-test-{}", Uuid::now_v7()));
        let log = dir.join("successful_downloads.txt");
        (dir, log)
    }

    fn entry(name: &str) -> CacheEntry {
        CacheEntry::parse(name).expect("conforming name")
    }

    #[test]
    fn load_creates_missing_log() {
        let (dir, log) = temp_log();
        let index = CacheIndex::load(&log).expect("load");
        assert!(log.exists());
        assert!(index.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn blank_and_duplicate_lines_collapse() {
        let messy = "siteInfo_1.00_2.00.xml\n\n   \nspecies_1.00_2.00_specId_8.xml\nsiteInfo_1.00_2.00.xml\n\n";
        let clean = "siteInfo_1.00_2.00.xml\nspecies_1.00_2.00_specId_8.xml\n";

        let (messy_set, stats) = parse_log(messy);
        let (clean_set, _) = parse_log(clean);

        assert_eq!(messy_set, clean_set);
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let content = "siteInfo_1.00_2.00.xml\ngarbage line\nsiteInfo_1.00_2\r\nsiteInfo_3.00_4.00.xml\r\n";
        let (set, stats) = parse_log(content);
        assert_eq!(set.len(), 2);
        assert_eq!(stats.malformed, 2);
        assert!(set.contains("siteInfo_3.00_4.00.xml"));
    }

    #[test]
    fn appended_entries_survive_reload() {
        let (dir, log) = temp_log();
        let index = CacheIndex::load(&log).unwrap();

        let item = WorkItem::new(Coordinate::new(148.16, -35.61), ResourceKind::SiteInfo);
        assert!(index.append(&item.cache_entry()).unwrap());
        assert!(index.append(&entry("species_1.00_2.00_specId_8.xml")).unwrap());
        assert!(index.contains("siteInfo_148.16_-35.61.xml"));
        drop(index);

        let reloaded = CacheIndex::load(&log).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("siteInfo_148.16_-35.61.xml"));
        assert!(reloaded.contains("species_1.00_2.00_specId_8.xml"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn append_after_partial_tail_keeps_both_lines_intact() {
        let (dir, log) = temp_log();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&log, "siteInfo_1.00_2.00.xml\nsiteInfo_3.0").unwrap();

        let index = CacheIndex::load(&log).unwrap();
        assert_eq!(index.load_stats().malformed, 1);
        assert!(index.append(&entry("siteInfo_5.00_6.00.xml")).unwrap());
        assert!(index.append(&entry("siteInfo_7.00_8.00.xml")).unwrap());
        drop(index);

        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            content,
            "siteInfo_1.00_2.00.xml\nsiteInfo_3.0\nsiteInfo_5.00_6.00.xml\nsiteInfo_7.00_8.00.xml\n"
        );
        let reloaded = CacheIndex::load(&log).unwrap();
        assert!(reloaded.contains("siteInfo_5.00_6.00.xml"));
        assert!(reloaded.contains("siteInfo_7.00_8.00.xml"));
        assert_eq!(reloaded.len(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_existing_does_not_create_the_log() {
        let (dir, log) = temp_log();
        assert!(CacheIndex::read_existing(&log).unwrap().is_none());
        assert!(!log.exists());
        assert!(!dir.exists());

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&log, "siteInfo_3.00_4.00.xml\n\nsiteInfo_1.00_2.00.xml\n").unwrap();
        let (entries, stats) = CacheIndex::read_existing(&log).unwrap().unwrap();
        assert_eq!(entries, vec!["siteInfo_1.00_2.00.xml", "siteInfo_3.00_4.00.xml"]);
        assert_eq!(stats.entries, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn duplicate_append_is_a_noop() {
        let (dir, log) = temp_log();
        let index = CacheIndex::load(&log).unwrap();
        let e = entry("siteInfo_1.00_2.00.xml");

        assert!(index.append(&e).unwrap());
        assert!(!index.append(&e).unwrap());

        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content.lines().count(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_appends_are_all_recorded() {
        let (dir, log) = temp_log();
        let index = std::sync::Arc::new(CacheIndex::load(&log).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let item = WorkItem::new(
                            Coordinate::new(f64::from(t), f64::from(i)),
                            ResourceKind::SiteInfo,
                        );
                        index.append(&item.cache_entry()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(index.len(), 400);

        let reloaded = CacheIndex::load(&log).unwrap();
        assert_eq!(reloaded.len(), 400);
        assert_eq!(reloaded.load_stats().malformed, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn filter_by_kind_and_discriminator() {
        let (dir, log) = temp_log();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            &log,
            "siteInfo_1.00_2.00.xml\nspecies_1.00_2.00_specId_8.xml\nspecies_1.00_2.00_specId_9.xml\nspecies_3.00_2.00_specId_8.xml\n",
        )
        .unwrap();
        let index = CacheIndex::load(&log).unwrap();

        let species8 = index.filter(&ResourceKind::Species { spec_id: 8 }.entry_filter());
        assert_eq!(species8.len(), 2);
        assert_eq!(species8[0].as_str(), "species_1.00_2.00_specId_8.xml");

        assert_eq!(index.filter(&EntryFilter::by_prefix("species")).len(), 3);
        assert_eq!(index.filter(&EntryFilter::by_discriminator("specId_9")).len(), 1);
        assert_eq!(index.filter(&EntryFilter::default()).len(), 4);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
