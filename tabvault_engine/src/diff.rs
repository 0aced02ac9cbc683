//! The append-only log of mutations made since the last stored snapshot, and compaction of that
//! log back into a snapshot.

use crate::VaultConfig;
use std::time::Duration;
use tabvault_time::Time;
use tabvault_types::{
    DiffOp, DiffSequenceNumber, Fragment, TargetKind, VaultDiffEntry, VaultDiffLog, VaultOp,
    VaultSnapshot,
};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct DiffManager {
    log: VaultDiffLog,
    /// Entries up to and including this sequence are already stored
    flushed_through: DiffSequenceNumber,
    last_compaction: Time,
    compaction_threshold: f64,
    idle_interval: Duration,
}

impl DiffManager {
    pub fn new(config: &VaultConfig, now: Time) -> Self {
        Self::with_log(config, VaultDiffLog::default(), now)
    }

    /// Resume from a log that was read back from storage. All of its entries count as flushed.
    pub fn with_log(config: &VaultConfig, log: VaultDiffLog, now: Time) -> Self {
        Self {
            flushed_through: log.last_sequence(),
            log,
            last_compaction: now,
            compaction_threshold: config.compaction_threshold,
            idle_interval: config.idle_compaction_interval,
        }
    }

    pub fn log(&self) -> &VaultDiffLog {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn last_sequence(&self) -> DiffSequenceNumber {
        self.log.last_sequence()
    }

    pub fn last_compaction(&self) -> Time {
        self.last_compaction
    }

    /// Record `op` at the end of the log, returning its sequence number.
    pub fn append(&mut self, op: VaultOp, time: Time) -> DiffSequenceNumber {
        let sequence = self.log.last_sequence().next();
        self.log.entries.push(VaultDiffEntry::new(sequence, op, time));
        sequence
    }

    /// True if the log holds entries that have not been stored yet.
    pub fn has_unflushed(&self) -> bool {
        self.log.last_sequence() > self.flushed_through
    }

    pub fn mark_flushed(&mut self, through: DiffSequenceNumber, base_checksum: u32) {
        self.flushed_through = self.flushed_through.max(through);
        self.log.base_checksum = base_checksum;
    }

    /// Whether the log should be folded into the snapshot before the next write.
    ///
    /// `log_bytes` and `snapshot_bytes` are the encoded sizes of the log and the base snapshot.
    pub fn should_compact(&self, log_bytes: usize, snapshot_bytes: usize, now: Time) -> bool {
        if self.log.is_empty() {
            return false;
        }
        if snapshot_bytes == 0 {
            return true;
        }
        if log_bytes as f64 / snapshot_bytes as f64 >= self.compaction_threshold {
            return true;
        }
        self.idle_compaction_due(now)
    }

    /// True once a non-empty log has gone the idle interval without a compaction.
    pub fn idle_compaction_due(&self, now: Time) -> bool {
        !self.log.is_empty()
            && now
                .checked_duration_since(self.last_compaction)
                .is_some_and(|idle| idle >= self.idle_interval)
    }

    /// Fold the whole log into `snapshot`, leaving the log empty.
    pub fn compact(&mut self, snapshot: &VaultSnapshot, now: Time) -> VaultSnapshot {
        self.compact_through(snapshot, self.log.last_sequence(), now)
    }

    /// Fold the entries up to and including `through` into `snapshot`. Later entries stay in the
    /// log, renumbered from 1.
    pub fn compact_through(
        &mut self,
        snapshot: &VaultSnapshot,
        through: DiffSequenceNumber,
        now: Time,
    ) -> VaultSnapshot {
        let split = self.log.entries.partition_point(|e| e.sequence <= through);
        let compacted = apply_entries(snapshot, &self.log.entries[..split]);
        self.discard_through(through, now);
        compacted
    }

    /// Drop the entries up to and including `through` once they have been folded into a stored
    /// snapshot elsewhere. Later entries are renumbered from 1 and count as unflushed.
    pub fn discard_through(&mut self, through: DiffSequenceNumber, now: Time) {
        let split = self.log.entries.partition_point(|e| e.sequence <= through);
        self.log.entries.drain(..split);

        let mut sequence = DiffSequenceNumber::ZERO;
        for entry in &mut self.log.entries {
            sequence = sequence.next();
            entry.sequence = sequence;
        }
        self.flushed_through = DiffSequenceNumber::ZERO;
        self.log.base_version = tabvault_types::VAULT_SCHEMA_VERSION;
        self.last_compaction = now;

        debug!(
            folded = split,
            remaining = self.log.len(),
            "compacted diff log"
        );
    }
}

/// `snapshot` with `entries` applied in order.
pub fn apply_entries(snapshot: &VaultSnapshot, entries: &[VaultDiffEntry]) -> VaultSnapshot {
    let mut snapshot = snapshot.clone();
    for entry in entries {
        apply_entry(&mut snapshot, entry);
    }
    snapshot
}

/// Apply one entry. `Add` replaces an existing item in place or appends, `Update` of an unknown
/// item is an implicit `Add`, and `Remove` of an unknown item does nothing.
pub fn apply_entry(snapshot: &mut VaultSnapshot, entry: &VaultDiffEntry) {
    snapshot.updated_at = snapshot.updated_at.max(entry.time);

    let id = entry.target_id.as_ref();
    match (entry.op, entry.target_kind) {
        (DiffOp::Remove, TargetKind::Group) => snapshot.groups.retain(|g| g.id.as_ref() != id),
        (DiffOp::Remove, TargetKind::Tab) => snapshot.tabs.retain(|t| t.id.as_ref() != id),
        (DiffOp::Add | DiffOp::Update, kind) => match (&entry.payload, kind) {
            (Some(Fragment::Group(group)), TargetKind::Group) => {
                upsert(&mut snapshot.groups, group.clone(), |g| g.id.as_ref() == id)
            }
            (Some(Fragment::Tab(tab)), TargetKind::Tab) => {
                upsert(&mut snapshot.tabs, tab.clone(), |t| t.id.as_ref() == id)
            }
            (payload, kind) => warn!(
                sequence = %entry.sequence,
                ?kind,
                payload_kind = ?payload.as_ref().map(Fragment::kind),
                "skipping diff entry without a matching payload"
            ),
        },
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, matches: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| matches(existing)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tabvault_types::{Group, Tab};

    fn manager() -> DiffManager {
        DiffManager::new(&VaultConfig::default(), Time::from_timestamp_millis(0))
    }

    fn at(millis: i64) -> Time {
        Time::from_timestamp_millis(millis)
    }

    #[test]
    fn append_assigns_increasing_sequences() {
        let mut diff = manager();
        assert_eq!(diff.append(VaultOp::add_group(Group::new("g", "G")), at(1)).as_u64(), 1);
        assert_eq!(diff.append(VaultOp::remove_group("g"), at(2)).as_u64(), 2);
        assert_eq!(diff.len(), 2);
        assert!(diff.has_unflushed());
        diff.mark_flushed(DiffSequenceNumber::new(2), 7);
        assert!(!diff.has_unflushed());
        assert_eq!(diff.log().base_checksum, 7);
    }

    #[test]
    fn should_compact_at_threshold() {
        let mut diff = manager();
        assert!(!diff.should_compact(1_000, 10, at(0)), "empty log never compacts");

        diff.append(VaultOp::remove_tab("t"), at(1));
        assert!(diff.should_compact(300, 1_000, at(1)));
        assert!(!diff.should_compact(299, 1_000, at(1)));
        assert!(diff.should_compact(1, 0, at(1)));
    }

    #[test]
    fn should_compact_when_idle() {
        let mut diff = manager();
        diff.append(VaultOp::remove_tab("t"), at(1));
        let idle = at(0) + VaultConfig::default().idle_compaction_interval;
        assert!(!diff.should_compact(1, 1_000, at(idle.timestamp_millis() - 1)));
        assert!(diff.should_compact(1, 1_000, idle));

        diff.compact(&VaultSnapshot::empty(at(0)), idle);
        diff.append(VaultOp::remove_tab("t"), idle);
        assert!(!diff.idle_compaction_due(idle + Duration::from_secs(60)));
    }

    #[test]
    fn apply_semantics() {
        let mut diff = manager();
        diff.append(VaultOp::add_group(Group::new("g1", "One")), at(10));
        diff.append(VaultOp::add_tab(Tab::new("t1", "https://a")), at(11));
        diff.append(VaultOp::add_tab(Tab::new("t2", "https://b")), at(12));
        // add of an existing id replaces in place
        diff.append(VaultOp::add_tab(Tab::new("t1", "https://a2")), at(13));
        // update of an unknown id is an implicit add
        diff.append(VaultOp::update_group(Group::new("g2", "Two")), at(14));
        // remove of an unknown id is ignored
        diff.append(VaultOp::remove_tab("nope"), at(15));
        diff.append(VaultOp::remove_tab("t2"), at(16));

        let base = VaultSnapshot::empty(at(5));
        let snapshot = diff.compact(&base, at(20));

        assert_eq!(snapshot.version, base.version);
        assert_eq!(snapshot.updated_at, at(16));
        assert_eq!(
            snapshot.groups,
            vec![Group::new("g1", "One"), Group::new("g2", "Two")]
        );
        assert_eq!(snapshot.tabs, vec![Tab::new("t1", "https://a2")]);
        assert!(diff.is_empty());
        assert_eq!(diff.last_sequence(), DiffSequenceNumber::ZERO);
        assert_eq!(diff.last_compaction(), at(20));
    }

    #[test]
    fn compact_through_keeps_later_entries() {
        let mut diff = manager();
        diff.append(VaultOp::add_tab(Tab::new("t1", "https://a")), at(1));
        let through = diff.append(VaultOp::add_tab(Tab::new("t2", "https://b")), at(2));
        diff.append(VaultOp::remove_tab("t1"), at(3));
        diff.append(VaultOp::add_tab(Tab::new("t3", "https://c")), at(4));

        let snapshot = diff.compact_through(&VaultSnapshot::empty(at(0)), through, at(5));
        assert_eq!(snapshot.tabs.len(), 2);
        assert_eq!(diff.len(), 2);
        let sequences: Vec<_> = diff.log().entries.iter().map(|e| e.sequence.as_u64()).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(diff.has_unflushed());

        let rest = diff.compact(&snapshot, at(6));
        let ids: Vec<_> = rest.tabs.iter().map(|t| t.id.as_ref()).collect();
        assert_eq!(ids, vec!["t2", "t3"]);
    }

    #[test]
    fn mismatched_payload_is_skipped() {
        let mut snapshot = VaultSnapshot::empty(at(0));
        let entry = VaultDiffEntry {
            sequence: DiffSequenceNumber::new(1),
            op: DiffOp::Add,
            target_kind: TargetKind::Group,
            target_id: "g1".into(),
            payload: Some(Fragment::Tab(Tab::new("g1", "https://x"))),
            time: at(1),
        };
        apply_entry(&mut snapshot, &entry);
        assert!(snapshot.is_empty());
    }

    fn arb_op() -> impl Strategy<Value = VaultOp> {
        let id = prop_oneof![Just("a"), Just("b"), Just("c")];
        (0..6u8, id, "[a-z]{0,4}").prop_map(|(kind, id, text)| match kind {
            0 => VaultOp::add_group(Group::new(id, text)),
            1 => VaultOp::update_group(Group::new(id, text)),
            2 => VaultOp::remove_group(id),
            3 => VaultOp::add_tab(Tab::new(id, text).in_group("a")),
            4 => VaultOp::update_tab(Tab::new(id, text)),
            _ => VaultOp::remove_tab(id),
        })
    }

    proptest! {
        #[test]
        fn compaction_matches_direct_application(
            ops in proptest::collection::vec(arb_op(), 0..40),
            split in 0usize..40,
        ) {
            let base = VaultSnapshot::empty(at(0));
            let mut diff = manager();
            let mut direct = base.clone();
            for (i, op) in ops.into_iter().enumerate() {
                let sequence = diff.append(op, at(i as i64 + 1));
                let entry = diff.log().entries.last().unwrap().clone();
                prop_assert_eq!(entry.sequence, sequence);
                apply_entry(&mut direct, &entry);
            }

            // folding in two steps matches folding at once and applying one by one
            let mut two_step = DiffManager::with_log(&VaultConfig::default(), diff.log().clone(), at(0));
            let through = DiffSequenceNumber::new(split as u64);
            let partial = two_step.compact_through(&base, through, at(100));
            let two_step = two_step.compact(&partial, at(100));

            let compacted = diff.compact(&base, at(100));
            prop_assert_eq!(&compacted, &direct);
            prop_assert_eq!(&two_step, &direct);

            // compacting an empty log is a no-op
            prop_assert_eq!(diff.compact(&compacted, at(200)), compacted);
        }
    }
}
