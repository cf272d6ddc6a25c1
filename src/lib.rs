//! Replica state engine for a leader-based consensus protocol.
//!
//! The crate covers the per-replica side of the protocol: the
//! AppendEntries / RequestVote / SubmitCommand handlers, log consistency
//! and commit advancement, state-machine application, chunked snapshots
//! with log compaction, and the Follower/Candidate/Leader role machine.
//! Transports, client sessions and configuration loading are collaborators
//! that drive [`engine::ReplicaEngine`] from outside.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod cluster;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod replication;
pub mod roles;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod telemetry;

pub use cluster::ClusterView;
pub use config::EngineConfig;
pub use context::{DurableState, MetadataError, MetadataStore, ReplicaContext};
pub use engine::ReplicaEngine;
pub use error::{ConfigError, ReplicorError, SerializationError};
pub use events::{EventBus, ReplicaEvent};
pub use protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, FrameError, PeerMessage,
    RequestVoteRequest, RequestVoteResponse, SubmitCommandRequest, SubmitCommandResponse,
    SubmitOutcome,
};
pub use replication::{
    apply_committed, handle_append_entries, handle_request_vote, reject_not_leader,
    AppliedCommand, FollowerCursor, Handled, ReplicationCursors,
};
pub use roles::{
    CandidateTally, ElectionSchedule, ElectionTimer, Role, RoleOutput, RoleStateMachine,
};
pub use snapshot::{
    build_snapshot_entries, maybe_compact, CombinedSnapshot, CompactionOutcome,
};
pub use state_machine::{
    CodecError, JsonSnapshotCodec, KvStateMachine, SnapshotCodec, StateMachine,
    StateMachineError,
};
pub use storage::{EntryKind, LogEntry, LogError, LogStore};
pub use telemetry::{MetricsRegistry, MetricsSnapshot};
