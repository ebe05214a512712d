//! Compaction
//!
//! Administrative, never part of the foreground path. The hole map walk is
//! live: it counts, per (level, sstable), how many entries are shadowed by a
//! newer layer or are tombstones. The merge passes themselves validate and
//! report but do not yet move data; their contract is reserved until the
//! on-disk free list learns to recycle retired block runs.

use alloc::collections::{BTreeMap, BTreeSet};

use crate::error::KernelResult;
use crate::tosdb::Tosdb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    /// Merge sstables within a level when holes exceed the threshold.
    Minor,
    /// Promote survivors into the next level.
    Major,
}

/// Hole fraction above which a minor merge would trigger.
pub const COMPACTION_HOLE_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub databases_visited: u64,
    pub tables_visited: u64,
    pub sstables_visited: u64,
    /// Entries shadowed by newer layers or deleted, per (level, sstable).
    pub hole_map: BTreeMap<(u64, u64), u64>,
    /// Merges performed. Zero while the merge contract is reserved.
    pub sstables_merged: u64,
}

impl CompactionStats {
    pub fn total_holes(&self) -> u64 {
        self.hole_map.values().sum()
    }
}

/// Visit every database, table and level in order; compute the hole map.
pub fn compact(db: &Tosdb, kind: CompactionKind) -> KernelResult<CompactionStats> {
    let mut stats = CompactionStats::default();

    for database in db.databases() {
        stats.databases_visited += 1;
        let database = database.lock();
        for table in database.tables() {
            stats.tables_visited += 1;
            let table = table.lock();

            // Keys already answered by a newer layer.
            let mut shadowed: BTreeSet<u64> = table.memtable_keys();

            for (level, metas) in table.levels() {
                for meta in metas.iter().rev() {
                    stats.sstables_visited += 1;
                    let index = table.load_index_items(db, meta)?;
                    let mut holes = 0u64;
                    for item in &index {
                        if shadowed.contains(&item.key) || item.deleted {
                            holes += 1;
                        }
                        shadowed.insert(item.key);
                    }
                    stats.hole_map.insert((level, meta.id), holes);
                }
            }
        }
    }

    crate::klog!(
        Tosdb,
        Info,
        "{:?} compaction: {} sstables, {} holes, {} merged",
        kind,
        stats.sstables_visited,
        stats.total_holes(),
        stats.sstables_merged
    );
    Ok(stats)
}
