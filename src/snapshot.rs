//! Snapshot pipeline: builds chunked snapshots of the state machine as
//! ordinary log entries, reassembles and installs them when a SnapshotEnd
//! entry applies, and compacts the log prefix behind `last_applied`.
//!
//! Snapshot entries replicate through the normal AppendEntries path; there
//! is no separate snapshot transfer.

use crate::context::ReplicaContext;
use crate::events::ReplicaEvent;
use crate::storage::{EntryKind, LogEntry, LogStore};
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A snapshot reassembled from a Start/Chunks/End run of log entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedSnapshot {
    pub term: u64,
    pub members: BTreeSet<String>,
    pub bytes: Vec<u8>,
    /// Number of log entries the snapshot spans, End included.
    pub entry_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Below the size threshold, or too little applied to be worth it.
    Skipped,
    Compacted {
        entries: usize,
        released_bytes: u64,
    },
    /// Something failed mid-window; the log was restored from backup.
    Aborted,
}

/// Builds the Start/Chunks/End entry run for a serialized snapshot,
/// assigning contiguous indices from `first_index`. Every entry carries
/// `term`.
pub fn build_snapshot_entries(
    term: u64,
    members: BTreeSet<String>,
    bytes: &[u8],
    chunk_bytes: usize,
    first_index: u64,
) -> Vec<LogEntry> {
    let mut entries = Vec::with_capacity(bytes.len().div_ceil(chunk_bytes.max(1)) + 2);
    let mut index = first_index;
    entries.push(LogEntry::snapshot_start(term, index, members));
    for chunk in bytes.chunks(chunk_bytes.max(1)) {
        index += 1;
        entries.push(LogEntry::snapshot_chunk(term, index, chunk.to_vec()));
    }
    entries.push(LogEntry::snapshot_end(term, index + 1, bytes.len() as u64));
    entries
}

/// Handles an applying SnapshotEnd entry at `end_index`: scan backwards for
/// the matching Start, install the combined snapshot, truncate the covered
/// prefix. Without a matching Start the entry is inert. `last_applied`
/// advances to `end_index` no matter what; a bad snapshot must not wedge
/// the log.
pub(crate) fn install_from_log(ctx: &mut ReplicaContext, end_index: u64) {
    let log_handle = Arc::clone(&ctx.log);
    let mut log = log_handle.lock();

    match reassemble(&log, end_index) {
        Some(snapshot) => {
            if let Err(reason) = install(ctx, &mut log, end_index, &snapshot) {
                warn!(
                    "event=replica_snapshot_install_failed end_index={} error={}",
                    end_index, reason
                );
            } else {
                info!(
                    "event=replica_snapshot_installed end_index={} entries={} bytes={}",
                    end_index,
                    snapshot.entry_count,
                    snapshot.bytes.len()
                );
            }
        }
        None => {
            warn!(
                "event=replica_snapshot_incomplete end_index={} reason=no_matching_start",
                end_index
            );
        }
    }
    ctx.set_last_applied(end_index);
}

/// Backward scan from the entry below `end_index`: collect contiguous
/// chunks until a Start is found; any other entry terminates the scan.
fn reassemble(log: &LogStore, end_index: u64) -> Option<CombinedSnapshot> {
    let mut chunks_backward: Vec<Vec<u8>> = Vec::new();
    let mut start: Option<(u64, BTreeSet<String>)> = None;
    let mut cursor = end_index;
    while start.is_none() && cursor > log.first_index() {
        cursor -= 1;
        match log.entry(cursor).map(|entry| (&entry.kind, entry.term)) {
            Some((EntryKind::SnapshotChunk { data }, _)) => chunks_backward.push(data.clone()),
            Some((EntryKind::SnapshotStart { members }, term)) => {
                start = Some((term, members.clone()));
            }
            _ => break,
        }
    }

    let (term, members) = start?;
    // Chunks were collected end-to-start; written order is the reverse.
    let bytes: Vec<u8> = chunks_backward
        .iter()
        .rev()
        .flat_map(|chunk| chunk.iter().copied())
        .collect();
    Some(CombinedSnapshot {
        term,
        members,
        bytes,
        entry_count: chunks_backward.len() as u64 + 2,
    })
}

fn install(
    ctx: &mut ReplicaContext,
    log: &mut LogStore,
    end_index: u64,
    snapshot: &CombinedSnapshot,
) -> Result<(), String> {
    let document = ctx
        .codec
        .decode(&snapshot.bytes)
        .map_err(|err| err.to_string())?;
    ctx.machine
        .install_snapshot(document)
        .map_err(|err| err.to_string())?;
    log.remove_before(end_index - snapshot.entry_count + 1)
        .map_err(|err| err.to_string())?;
    ctx.cluster
        .set_remote_members(snapshot.members.iter().cloned());
    ctx.events.publish(ReplicaEvent::MembershipChange {
        members: ctx.cluster.members(),
    });
    ctx.advance_term(snapshot.term)
        .map_err(|err| err.to_string())?;
    Ok(())
}

/// Compacts the applied prefix into snapshot entries once the log exceeds
/// the configured size. The whole backup/prepend/commit window runs under
/// one log lock; concurrent appends wait.
pub fn maybe_compact(ctx: &mut ReplicaContext) -> CompactionOutcome {
    let log_handle = Arc::clone(&ctx.log);
    let mut log = log_handle.lock();
    if log.size_bytes() <= ctx.config.max_log_bytes() {
        return CompactionOutcome::Skipped;
    }
    let size_before = log.size_bytes();
    if let Err(err) = log.backup() {
        warn!("event=replica_compaction_abort stage=backup error={}", err);
        return CompactionOutcome::Aborted;
    }

    match stage_compaction(ctx, &mut log) {
        Ok(Some(entries)) => {
            let released_bytes = size_before.saturating_sub(log.size_bytes());
            info!(
                "event=replica_compaction_done entries={} released_bytes={} first_index={}",
                entries,
                released_bytes,
                log.first_index()
            );
            CompactionOutcome::Compacted {
                entries,
                released_bytes,
            }
        }
        Ok(None) => {
            // Not enough applied entries to cover the snapshot run.
            if let Err(err) = log.restore() {
                warn!("event=replica_compaction_abort stage=unwind error={}", err);
                return CompactionOutcome::Aborted;
            }
            CompactionOutcome::Skipped
        }
        Err(reason) => {
            warn!("event=replica_compaction_abort stage=stage error={}", reason);
            if let Err(err) = log.restore() {
                warn!("event=replica_compaction_abort stage=restore error={}", err);
            }
            CompactionOutcome::Aborted
        }
    }
}

fn stage_compaction(
    ctx: &ReplicaContext,
    log: &mut LogStore,
) -> Result<Option<usize>, String> {
    let document = ctx.machine.take_snapshot().map_err(|err| err.to_string())?;
    let bytes = ctx.codec.encode(&document).map_err(|err| err.to_string())?;
    let chunk_bytes = ctx.config.snapshot_chunk_bytes();
    let count = bytes.len().div_ceil(chunk_bytes) as u64 + 2;
    let last_applied = ctx.last_applied;
    if last_applied <= count {
        return Ok(None);
    }

    let entries = build_snapshot_entries(
        ctx.current_term(),
        ctx.cluster.members(),
        &bytes,
        chunk_bytes,
        last_applied + 1 - count,
    );
    let count = entries.len();
    log.remove_before(last_applied + 1)
        .map_err(|err| err.to_string())?;
    log.prepend(entries).map_err(|err| err.to_string())?;
    log.commit().map_err(|err| err.to_string())?;
    Ok(Some(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterView;
    use crate::config::EngineConfig;
    use crate::context::{MetadataStore, ReplicaContext};
    use crate::storage::LogStore;
    use crate::replication::apply_committed;
    use crate::state_machine::{JsonSnapshotCodec, KvStateMachine, SnapshotCodec, StateMachine};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn context_with(tmp: &TempDir, config: EngineConfig) -> ReplicaContext {
        let log = Arc::new(Mutex::new(
            LogStore::open(tmp.path().join("replica.log")).unwrap(),
        ));
        ReplicaContext::new(
            config,
            ClusterView::new("a", ["b".to_string(), "c".to_string()]),
            log,
            Box::new(KvStateMachine::new()),
            Box::new(JsonSnapshotCodec),
            MetadataStore::new(tmp.path().join("metadata.json")),
        )
        .unwrap()
    }

    fn members(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn snapshot_entries_cover_the_payload() {
        let entries = build_snapshot_entries(3, members(&["a", "b"]), &[0u8; 10], 4, 7);
        // Start + three chunks (4+4+2) + End.
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].index, 7);
        assert!(matches!(entries[0].kind, EntryKind::SnapshotStart { .. }));
        assert!(matches!(
            entries[4].kind,
            EntryKind::SnapshotEnd { total_bytes: 10 }
        ));
        assert_eq!(entries[4].index, 11);
        assert!(entries.iter().all(|entry| entry.term == 3));
    }

    #[test]
    fn empty_payload_builds_start_and_end_only() {
        let entries = build_snapshot_entries(1, members(&["a"]), &[], 4096, 1);
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[1].kind,
            EntryKind::SnapshotEnd { total_bytes: 0 }
        ));
    }

    #[test]
    fn install_reassembles_chunks_in_written_order() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context_with(&tmp, EngineConfig::default());
        let codec = JsonSnapshotCodec;
        let mut donor = KvStateMachine::new();
        donor
            .apply_command(
                "put",
                br#"{"key":"restored","value":"yes"}"#,
            )
            .unwrap();
        let bytes = codec.encode(&donor.take_snapshot().unwrap()).unwrap();

        {
            let mut log = ctx.log().lock();
            for i in 1..=9 {
                log.append(LogEntry::noop(1, i)).unwrap();
            }
            for entry in build_snapshot_entries(3, members(&["a", "b", "c"]), &bytes, 2, 10) {
                log.append(entry).unwrap();
            }
        }
        let end_index = ctx.log().lock().last_index();
        ctx.commit_index = end_index;
        apply_committed(&mut ctx);

        assert_eq!(ctx.last_applied(), end_index);
        assert_eq!(ctx.log().lock().first_index(), 10);
        assert!(ctx.current_term() >= 3);
        let doc = ctx.machine().take_snapshot().unwrap();
        assert_eq!(doc["restored"], "yes");
    }

    #[test]
    fn snapshot_end_without_start_is_inert() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context_with(&tmp, EngineConfig::default());
        {
            let mut log = ctx.log().lock();
            log.append(LogEntry::noop(1, 1)).unwrap();
            log.append(LogEntry::snapshot_chunk(1, 2, vec![1, 2])).unwrap();
            log.append(LogEntry::snapshot_end(1, 3, 2)).unwrap();
        }
        ctx.commit_index = 3;
        apply_committed(&mut ctx);
        assert_eq!(ctx.last_applied(), 3);
        assert_eq!(ctx.log().lock().first_index(), 1, "log untouched");
    }

    #[test]
    fn corrupt_snapshot_bytes_still_advance_last_applied() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context_with(&tmp, EngineConfig::default());
        {
            let mut log = ctx.log().lock();
            log.append(LogEntry::snapshot_start(1, 1, members(&["a", "b"])))
                .unwrap();
            log.append(LogEntry::snapshot_chunk(1, 2, b"not json".to_vec()))
                .unwrap();
            log.append(LogEntry::snapshot_end(1, 3, 8)).unwrap();
        }
        ctx.commit_index = 3;
        apply_committed(&mut ctx);
        assert_eq!(ctx.last_applied(), 3);
        // Failed install leaves the log prefix in place.
        assert_eq!(ctx.log().lock().first_index(), 1);
    }

    #[test]
    fn reinstalling_the_same_snapshot_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context_with(&tmp, EngineConfig::default());
        let codec = JsonSnapshotCodec;
        let mut donor = KvStateMachine::new();
        donor
            .apply_command("put", br#"{"key":"k","value":"v"}"#)
            .unwrap();
        let bytes = codec.encode(&donor.take_snapshot().unwrap()).unwrap();
        {
            let mut log = ctx.log().lock();
            for entry in build_snapshot_entries(2, members(&["a", "b"]), &bytes, 4096, 1) {
                log.append(entry).unwrap();
            }
        }
        let end_index = ctx.log().lock().last_index();
        ctx.commit_index = end_index;
        apply_committed(&mut ctx);
        let first_pass = ctx.machine().take_snapshot().unwrap();

        install_from_log(&mut ctx, end_index);
        let second_pass = ctx.machine().take_snapshot().unwrap();
        assert_eq!(first_pass, second_pass);
        assert_eq!(ctx.log().lock().first_index(), 1);
    }

    #[test]
    fn compaction_replaces_applied_prefix_with_snapshot_run() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::new(
            512,
            std::time::Duration::from_millis(150),
            std::time::Duration::from_millis(300),
            std::time::Duration::from_millis(50),
        )
        .unwrap()
        .with_snapshot_chunk_bytes(64)
        .unwrap();
        let mut ctx = context_with(&tmp, config);
        ctx.advance_term(2).unwrap();
        {
            let mut log = ctx.log().lock();
            for i in 1..=20 {
                let args = serde_json::to_vec(
                    &serde_json::json!({ "key": format!("key-{i:03}"), "value": "value" }),
                )
                .unwrap();
                log.append(LogEntry::command(2, i, "put", args)).unwrap();
            }
        }
        ctx.commit_index = 20;
        apply_committed(&mut ctx);
        let size_before = ctx.log().lock().size_bytes();
        assert!(size_before > 512);

        let outcome = maybe_compact(&mut ctx);
        assert!(matches!(outcome, CompactionOutcome::Compacted { .. }));
        let log = ctx.log().lock();
        assert!(matches!(
            log.entry(log.first_index()).unwrap().kind,
            EntryKind::SnapshotStart { .. }
        ));
        assert_eq!(log.last_index(), 20);
        assert!(log.first_index() > 1);
        assert!(log.size_bytes() < size_before);
        assert!(!log.has_staged_backup());
    }

    #[test]
    fn small_logs_are_left_alone() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context_with(&tmp, EngineConfig::default());
        ctx.log().lock().append(LogEntry::noop(1, 1)).unwrap();
        assert_eq!(maybe_compact(&mut ctx), CompactionOutcome::Skipped);
    }

    #[test]
    fn compaction_with_thin_applied_prefix_restores_and_skips() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::new(
            16,
            std::time::Duration::from_millis(150),
            std::time::Duration::from_millis(300),
            std::time::Duration::from_millis(50),
        )
        .unwrap();
        let mut ctx = context_with(&tmp, config);
        {
            let mut log = ctx.log().lock();
            log.append(LogEntry::noop(1, 1)).unwrap();
            log.append(LogEntry::noop(1, 2)).unwrap();
        }
        ctx.commit_index = 2;
        apply_committed(&mut ctx);

        let before: Vec<_> = ctx.log().lock().entries_from(1, 16);
        assert_eq!(maybe_compact(&mut ctx), CompactionOutcome::Skipped);
        let after: Vec<_> = ctx.log().lock().entries_from(1, 16);
        assert_eq!(before, after);
        assert!(!ctx.log().lock().has_staged_backup());
    }
}
