//! Shared replica state. The context is the hub: it owns the log handle,
//! cluster view, state machine, codec and event bus; the role FSM and the
//! request handlers borrow it for the duration of a call.

use crate::cluster::ClusterView;
use crate::config::EngineConfig;
use crate::events::{EventBus, ReplicaEvent};
use crate::storage::LogStore;
use crate::state_machine::{SnapshotCodec, StateMachine};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Election state that must survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DurableState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

/// JSON document persisted with write-to-temp + fsync + rename.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_default(&self) -> Result<DurableState, MetadataError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DurableState::default()),
            Err(err) => Err(MetadataError::Io(err)),
        }
    }

    pub fn persist(&self, state: &DurableState) -> Result<(), MetadataError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(state)?)?;
        file.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct ReplicaContext {
    pub(crate) config: EngineConfig,
    pub(crate) cluster: ClusterView,
    pub(crate) log: Arc<Mutex<LogStore>>,
    pub(crate) machine: Box<dyn StateMachine>,
    pub(crate) codec: Box<dyn SnapshotCodec>,
    pub(crate) events: EventBus,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    durable: DurableState,
    metadata: MetadataStore,
}

impl ReplicaContext {
    pub fn new(
        config: EngineConfig,
        cluster: ClusterView,
        log: Arc<Mutex<LogStore>>,
        machine: Box<dyn StateMachine>,
        codec: Box<dyn SnapshotCodec>,
        metadata: MetadataStore,
    ) -> Result<Self, MetadataError> {
        let durable = metadata.load_or_default()?;
        Ok(Self {
            config,
            cluster,
            log,
            machine,
            codec,
            events: EventBus::new(),
            commit_index: 0,
            last_applied: 0,
            durable,
            metadata,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn log(&self) -> &Arc<Mutex<LogStore>> {
        &self.log
    }

    pub fn machine(&self) -> &dyn StateMachine {
        self.machine.as_ref()
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn current_term(&self) -> u64 {
        self.durable.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.durable.voted_for.as_deref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn current_leader(&self) -> Option<&str> {
        self.cluster.leader()
    }

    /// Adopts a higher term, clearing the recorded vote. A no-op for equal
    /// or lower terms; the vote for the current term stays intact.
    pub fn advance_term(&mut self, term: u64) -> Result<(), MetadataError> {
        if term <= self.durable.current_term {
            return Ok(());
        }
        info!(
            "event=replica_term_advance previous={} next={}",
            self.durable.current_term, term
        );
        self.durable.current_term = term;
        self.durable.voted_for = None;
        self.metadata.persist(&self.durable)
    }

    /// Records a vote durably, then publishes the grant.
    pub fn record_vote(&mut self, candidate: &str) -> Result<(), MetadataError> {
        self.durable.voted_for = Some(candidate.to_string());
        self.metadata.persist(&self.durable)?;
        self.events.publish(ReplicaEvent::VoteCast {
            term: self.durable.current_term,
            candidate: candidate.to_string(),
        });
        Ok(())
    }

    pub fn clear_vote(&mut self) -> Result<(), MetadataError> {
        if self.durable.voted_for.is_none() {
            return Ok(());
        }
        self.durable.voted_for = None;
        self.metadata.persist(&self.durable)
    }

    pub fn set_leader(&mut self, leader: Option<String>) {
        if self.cluster.leader() == leader.as_deref() {
            return;
        }
        self.cluster.set_leader(leader.clone());
        self.events.publish(ReplicaEvent::LeaderChange {
            term: self.durable.current_term,
            leader,
        });
    }

    /// `last_applied` moves strictly forward; going backwards would mean an
    /// out-of-order apply, which is corruption.
    pub fn set_last_applied(&mut self, index: u64) {
        assert!(
            index >= self.last_applied,
            "last_applied cannot move backwards ({} -> {})",
            self.last_applied,
            index
        );
        self.last_applied = index;
    }
}
