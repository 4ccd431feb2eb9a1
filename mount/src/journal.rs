//! The mount's append-only change log.
//!
//! The journal is the sole authoritative answer to "what changed since
//! sequence N". It lives in memory under a byte budget; once old records
//! are evicted, ranges reaching back past the eviction point are flagged
//! truncated and the reader is expected to fall back to a full diff.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use canopy_castore::{RelativePathBuf, RootId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Fixed accounting overhead per record, on top of path bytes.
const RECORD_OVERHEAD: usize = 64;

/// The default in-memory budget, matching a few million path records.
pub const DEFAULT_MEMORY_LIMIT: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    /// The working-copy parent moved.
    RootChanged { old: RootId, new: RootId },
    PathCreated(RelativePathBuf),
    PathRemoved(RelativePathBuf),
    PathChanged(RelativePathBuf),
    PathRenamed { src: RelativePathBuf, dst: RelativePathBuf },
    /// A rename that replaced an existing destination.
    PathReplaced { src: RelativePathBuf, dst: RelativePathBuf },
    /// Bulk record emitted at the end of checkout for paths that were
    /// already dirty before the transition.
    UncleanPaths {
        old: RootId,
        new: RootId,
        paths: BTreeSet<RelativePathBuf>,
    },
}

impl JournalRecord {
    fn memory_usage(&self) -> usize {
        let paths = match self {
            JournalRecord::RootChanged { .. } => 0,
            JournalRecord::PathCreated(p)
            | JournalRecord::PathRemoved(p)
            | JournalRecord::PathChanged(p) => p.as_bytes().len(),
            JournalRecord::PathRenamed { src, dst }
            | JournalRecord::PathReplaced { src, dst } => {
                src.as_bytes().len() + dst.as_bytes().len()
            }
            JournalRecord::UncleanPaths { paths, .. } => {
                paths.iter().map(|p| p.as_bytes().len()).sum()
            }
        };
        RECORD_OVERHEAD + paths
    }
}

/// How a path moved across an accumulated range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathChangeInfo {
    pub existed_before: bool,
    pub existed_after: bool,
}

/// The summarized delta returned by [Journal::accumulate_range].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalDeltaRange {
    pub from_seq: u64,
    pub to_seq: u64,
    pub changed_paths: BTreeMap<RelativePathBuf, PathChangeInfo>,
    pub unclean_paths: BTreeSet<RelativePathBuf>,
    /// Root transitions in order, oldest first.
    pub snapshot_transitions: Vec<(RootId, RootId)>,
    /// Set when records inside the requested range have been evicted under
    /// the memory budget; the summary is then incomplete.
    pub is_truncated: bool,
}

struct JournalState {
    records: VecDeque<(u64, JournalRecord)>,
    next_seq: u64,
    memory_usage: usize,
    /// Sequence number of the oldest record ever evicted, if any.
    evicted_through: Option<u64>,
}

/// Append-only, in-memory change log with a byte budget.
pub struct Journal {
    state: Mutex<JournalState>,
    memory_limit: usize,
    notify: watch::Sender<u64>,
}

impl Journal {
    pub fn new(memory_limit: usize) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            state: Mutex::new(JournalState {
                records: VecDeque::new(),
                next_seq: 1,
                memory_usage: 0,
                evicted_through: None,
            }),
            memory_limit,
            notify,
        }
    }

    /// Appends a record, evicting from the front if over budget, and
    /// notifies subscribers. Returns the record's sequence number.
    pub fn append(&self, record: JournalRecord) -> u64 {
        let seq = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.memory_usage += record.memory_usage();
            state.records.push_back((seq, record));

            while state.memory_usage > self.memory_limit && state.records.len() > 1 {
                if let Some((evicted_seq, evicted)) = state.records.pop_front() {
                    state.memory_usage -= evicted.memory_usage();
                    state.evicted_through = Some(evicted_seq);
                    debug!(seq = evicted_seq, "evicted journal record");
                }
            }
            seq
        };
        // Subscribers get a bare notification; the payload is always
        // re-read through accumulate_range.
        let _ = self.notify.send(seq);
        seq
    }

    pub fn record_created(&self, path: RelativePathBuf) -> u64 {
        self.append(JournalRecord::PathCreated(path))
    }

    pub fn record_removed(&self, path: RelativePathBuf) -> u64 {
        self.append(JournalRecord::PathRemoved(path))
    }

    pub fn record_changed(&self, path: RelativePathBuf) -> u64 {
        self.append(JournalRecord::PathChanged(path))
    }

    pub fn record_renamed(&self, src: RelativePathBuf, dst: RelativePathBuf) -> u64 {
        self.append(JournalRecord::PathRenamed { src, dst })
    }

    pub fn record_replaced(&self, src: RelativePathBuf, dst: RelativePathBuf) -> u64 {
        self.append(JournalRecord::PathReplaced { src, dst })
    }

    pub fn record_root_changed(&self, old: RootId, new: RootId) -> u64 {
        self.append(JournalRecord::RootChanged { old, new })
    }

    pub fn record_unclean_paths(
        &self,
        old: RootId,
        new: RootId,
        paths: BTreeSet<RelativePathBuf>,
    ) -> u64 {
        self.append(JournalRecord::UncleanPaths { old, new, paths })
    }

    /// The sequence number of the latest record, or 0 if none.
    pub fn latest_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// A receiver that yields the latest sequence number on every append.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Summarizes every record with sequence >= `from_seq`.
    pub fn accumulate_range(&self, from_seq: u64) -> JournalDeltaRange {
        let state = self.state.lock();
        let mut range = JournalDeltaRange {
            from_seq,
            to_seq: state.next_seq - 1,
            ..Default::default()
        };
        if let Some(evicted) = state.evicted_through {
            if from_seq <= evicted {
                range.is_truncated = true;
            }
        }

        for (seq, record) in state.records.iter() {
            if *seq < from_seq {
                continue;
            }
            match record {
                JournalRecord::RootChanged { old, new } => {
                    range.snapshot_transitions.push((old.clone(), new.clone()));
                }
                JournalRecord::PathCreated(p) => {
                    merge(&mut range.changed_paths, p, false, true);
                }
                JournalRecord::PathRemoved(p) => {
                    merge(&mut range.changed_paths, p, true, false);
                }
                JournalRecord::PathChanged(p) => {
                    merge(&mut range.changed_paths, p, true, true);
                }
                JournalRecord::PathRenamed { src, dst }
                | JournalRecord::PathReplaced { src, dst } => {
                    merge(&mut range.changed_paths, src, true, false);
                    merge(&mut range.changed_paths, dst, false, true);
                }
                JournalRecord::UncleanPaths { paths, .. } => {
                    range.unclean_paths.extend(paths.iter().cloned());
                }
            }
        }
        range
    }
}

/// Folds a single record's before/after view into the accumulated one:
/// `existed_before` comes from the oldest record for the path,
/// `existed_after` from the newest.
fn merge(
    changed: &mut BTreeMap<RelativePathBuf, PathChangeInfo>,
    path: &RelativePathBuf,
    existed_before: bool,
    existed_after: bool,
) {
    changed
        .entry(path.clone())
        .and_modify(|info| info.existed_after = existed_after)
        .or_insert(PathChangeInfo {
            existed_before,
            existed_after,
        });
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RelativePathBuf {
        s.parse().unwrap()
    }

    #[test]
    fn sequence_numbers_increase() {
        let journal = Journal::default();
        let a = journal.record_created(path("a"));
        let b = journal.record_changed(path("a"));
        assert!(b > a);
        assert_eq!(journal.latest_seq(), b);
    }

    #[test]
    fn accumulate_merges_per_path() {
        let journal = Journal::default();
        journal.record_created(path("a"));
        let mid = journal.record_changed(path("a"));
        journal.record_removed(path("b"));
        journal.record_renamed(path("c"), path("d"));

        let range = journal.accumulate_range(1);
        assert!(!range.is_truncated);
        assert_eq!(
            range.changed_paths[&path("a")],
            PathChangeInfo { existed_before: false, existed_after: true }
        );
        assert_eq!(
            range.changed_paths[&path("b")],
            PathChangeInfo { existed_before: true, existed_after: false }
        );
        assert_eq!(
            range.changed_paths[&path("c")],
            PathChangeInfo { existed_before: true, existed_after: false }
        );
        assert_eq!(
            range.changed_paths[&path("d")],
            PathChangeInfo { existed_before: false, existed_after: true }
        );

        // A partial range only sees later records.
        let tail = journal.accumulate_range(mid + 1);
        assert!(!tail.changed_paths.contains_key(&path("a")));
    }

    #[test]
    fn eviction_flags_truncation() {
        // A budget small enough to hold only a couple of records.
        let journal = Journal::new(2 * RECORD_OVERHEAD + 8);
        journal.record_created(path("aaaa"));
        journal.record_created(path("bbbb"));
        journal.record_created(path("cccc"));

        let range = journal.accumulate_range(1);
        assert!(range.is_truncated);
        assert!(!range.changed_paths.contains_key(&path("aaaa")));

        let recent = journal.accumulate_range(3);
        assert!(!recent.is_truncated);
        assert!(recent.changed_paths.contains_key(&path("cccc")));
    }

    #[tokio::test]
    async fn subscribers_are_notified() {
        let journal = Journal::default();
        let mut rx = journal.subscribe();
        assert_eq!(*rx.borrow(), 0);

        journal.record_created(path("a"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[test]
    fn root_transitions_and_unclean_paths() {
        let journal = Journal::default();
        let r0 = RootId::from_bytes(&b"r0"[..]);
        let r1 = RootId::from_bytes(&b"r1"[..]);
        journal.record_root_changed(r0.clone(), r1.clone());
        journal.record_unclean_paths(
            r0.clone(),
            r1.clone(),
            [path("x")].into_iter().collect(),
        );

        let range = journal.accumulate_range(1);
        assert_eq!(range.snapshot_transitions, vec![(r0, r1)]);
        assert!(range.unclean_paths.contains(&path("x")));
    }
}
