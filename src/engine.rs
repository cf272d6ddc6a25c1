//! The replica event loop. One engine per replica; every call mutates state
//! on the caller's thread, so a transport dispatches all inbound messages
//! and timer ticks onto a single driving thread. Replies are produced
//! before any armed role transition fires, and pending submissions are
//! cancelled the moment leadership is lost.

use crate::cluster::ClusterView;
use crate::config::EngineConfig;
use crate::context::{MetadataStore, ReplicaContext};
use crate::error::ReplicorError;
use crate::events::ReplicaEvent;
use crate::storage::LogStore;
use crate::protocol::{Envelope, PeerMessage, SubmitCommandRequest, SubmitCommandResponse};
use crate::replication::{handler, AppliedCommand};
use crate::roles::{Role, RoleOutput, RoleStateMachine};
use crate::state_machine::{SnapshotCodec, StateMachine};
use crate::telemetry::{MetricsRegistry, MetricsSnapshot};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const LEADERSHIP_LOST: &str = "leadership lost";

#[derive(Debug, Clone)]
struct PendingSubmit {
    request_id: u64,
    client: String,
    term: u64,
}

pub struct ReplicaEngine {
    ctx: ReplicaContext,
    roles: RoleStateMachine,
    /// Log index -> submission awaiting that entry's application.
    pending: HashMap<u64, PendingSubmit>,
    metrics: MetricsRegistry,
}

impl ReplicaEngine {
    /// Opens (or creates) the replica's durable state under `data_dir`.
    pub fn open(
        config: EngineConfig,
        cluster: ClusterView,
        data_dir: &Path,
        machine: Box<dyn StateMachine>,
        codec: Box<dyn SnapshotCodec>,
        seed: u64,
        now: Instant,
    ) -> Result<Self, ReplicorError> {
        let log = Arc::new(Mutex::new(LogStore::open(data_dir.join("replica.log"))?));
        let metadata = MetadataStore::new(data_dir.join("metadata.json"));
        let ctx = ReplicaContext::new(config, cluster, log, machine, codec, metadata)?;
        let roles = RoleStateMachine::new(ctx.config().election_timeout(), seed, now);
        Ok(Self {
            ctx,
            roles,
            pending: HashMap::new(),
            metrics: MetricsRegistry::new("replicor"),
        })
    }

    pub fn role(&self) -> Role {
        self.roles.role()
    }

    pub fn current_term(&self) -> u64 {
        self.ctx.current_term()
    }

    pub fn commit_index(&self) -> u64 {
        self.ctx.commit_index()
    }

    pub fn last_applied(&self) -> u64 {
        self.ctx.last_applied()
    }

    pub fn leader_hint(&self) -> Option<String> {
        self.ctx.current_leader().map(str::to_string)
    }

    pub fn context(&self) -> &ReplicaContext {
        &self.ctx
    }

    pub fn election_deadline(&self) -> Instant {
        self.roles.election_deadline()
    }

    pub fn drain_events(&mut self) -> Vec<ReplicaEvent> {
        self.ctx.events_mut().drain()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Timer-driven progress: elections and heartbeats.
    pub fn tick(&mut self, now: Instant) -> Vec<Envelope> {
        self.drive(now, |roles, ctx| roles.tick(ctx, now))
    }

    /// Processes one inbound message from `from` (a member or client id)
    /// and returns everything to send in response.
    pub fn handle_message(&mut self, from: &str, message: PeerMessage, now: Instant) -> Vec<Envelope> {
        match message {
            PeerMessage::AppendEntries(request) => {
                let handled = match handler::handle_append_entries(&mut self.ctx, &request) {
                    Ok(handled) => handled,
                    Err(err) => {
                        warn!("event=replica_handler_error operation=append_entries error={}", err);
                        return Vec::new();
                    }
                };
                self.metrics.counter("append_entries_handled", 1);
                let mut outbound = vec![Envelope {
                    to: from.to_string(),
                    message: PeerMessage::AppendEntriesReply(handled.response),
                }];
                // Any append from a live leader of the current term defers
                // the next election, accepted or not.
                if request.term == self.ctx.current_term() {
                    self.roles.reset_election_timer(now);
                }
                outbound.extend(self.complete_applied(handled.applied));
                if handled.step_down {
                    outbound.extend(self.step_down(now));
                }
                self.publish_metrics();
                outbound
            }
            PeerMessage::RequestVote(request) => {
                let handled = match handler::handle_request_vote(&mut self.ctx, &request) {
                    Ok(handled) => handled,
                    Err(err) => {
                        warn!("event=replica_handler_error operation=request_vote error={}", err);
                        return Vec::new();
                    }
                };
                if handled.response.vote_granted {
                    self.metrics.counter("votes_granted", 1);
                    self.roles.reset_election_timer(now);
                }
                let mut outbound = vec![Envelope {
                    to: from.to_string(),
                    message: PeerMessage::RequestVoteReply(handled.response),
                }];
                if handled.step_down {
                    outbound.extend(self.step_down(now));
                }
                self.publish_metrics();
                outbound
            }
            PeerMessage::RequestVoteReply(response) => {
                let from = from.to_string();
                self.drive(now, move |roles, ctx| {
                    roles.on_vote_response(ctx, &from, &response, now)
                })
            }
            PeerMessage::AppendEntriesReply(response) => {
                let from = from.to_string();
                self.drive(now, move |roles, ctx| {
                    roles.on_append_response(ctx, &from, &response, now)
                })
            }
            PeerMessage::SubmitCommand(request) => self.handle_submit(from, request),
            // Replies to clients terminate here; a replica never consumes one.
            PeerMessage::SubmitCommandReply(_) => Vec::new(),
        }
    }

    fn handle_submit(&mut self, from: &str, request: SubmitCommandRequest) -> Vec<Envelope> {
        if self.roles.role() != Role::Leader {
            self.metrics.counter("submit_rejected", 1);
            return vec![Envelope {
                to: from.to_string(),
                message: PeerMessage::SubmitCommandReply(handler::reject_not_leader(&request)),
            }];
        }
        match self
            .roles
            .leader_append_command(&mut self.ctx, &request.command, request.args)
        {
            Ok((term, index, output)) => {
                self.pending.insert(
                    index,
                    PendingSubmit {
                        request_id: request.id,
                        client: from.to_string(),
                        term,
                    },
                );
                let mut outbound = output.outbound;
                outbound.extend(self.complete_applied(output.applied));
                self.publish_metrics();
                outbound
            }
            Err(err) => {
                warn!("event=replica_submit_failed error={}", err);
                vec![Envelope {
                    to: from.to_string(),
                    message: PeerMessage::SubmitCommandReply(SubmitCommandResponse::error(
                        request.id,
                        "submission failed",
                    )),
                }]
            }
        }
    }

    fn drive<F>(&mut self, now: Instant, operation: F) -> Vec<Envelope>
    where
        F: FnOnce(&mut RoleStateMachine, &mut ReplicaContext) -> Result<RoleOutput, ReplicorError>,
    {
        let was_leader = self.roles.role() == Role::Leader;
        match operation(&mut self.roles, &mut self.ctx) {
            Ok(output) => {
                let mut outbound = output.outbound;
                outbound.extend(self.complete_applied(output.applied));
                if was_leader && self.roles.role() != Role::Leader {
                    outbound.extend(self.cancel_pending(LEADERSHIP_LOST));
                }
                self.publish_metrics();
                outbound
            }
            Err(err) => {
                warn!("event=replica_role_error error={}", err);
                Vec::new()
            }
        }
    }

    /// Fires an armed post-reply transition to Follower.
    fn step_down(&mut self, now: Instant) -> Vec<Envelope> {
        let was_leader = self.roles.role() == Role::Leader;
        self.roles.step_down(&mut self.ctx, now);
        if was_leader {
            self.cancel_pending(LEADERSHIP_LOST)
        } else {
            Vec::new()
        }
    }

    /// Completes submissions whose entries just applied. An entry whose
    /// term changed underneath the submission was replaced by another
    /// leader's entry; the submitter is told leadership was lost.
    fn complete_applied(&mut self, applied: Vec<AppliedCommand>) -> Vec<Envelope> {
        let mut outbound = Vec::new();
        for command in applied {
            let Some(pending) = self.pending.remove(&command.index) else {
                continue;
            };
            let response = if pending.term != command.term {
                SubmitCommandResponse::error(pending.request_id, LEADERSHIP_LOST)
            } else {
                match command.outcome {
                    Ok(bytes) => SubmitCommandResponse::result(pending.request_id, bytes),
                    Err(message) => SubmitCommandResponse::error(pending.request_id, message),
                }
            };
            outbound.push(Envelope {
                to: pending.client,
                message: PeerMessage::SubmitCommandReply(response),
            });
        }
        outbound
    }

    fn cancel_pending(&mut self, reason: &str) -> Vec<Envelope> {
        let mut cancelled: Vec<(u64, PendingSubmit)> = self.pending.drain().collect();
        cancelled.sort_by_key(|(index, _)| *index);
        cancelled
            .into_iter()
            .map(|(_, pending)| Envelope {
                to: pending.client,
                message: PeerMessage::SubmitCommandReply(SubmitCommandResponse::error(
                    pending.request_id,
                    reason,
                )),
            })
            .collect()
    }

    fn publish_metrics(&mut self) {
        self.metrics.gauge("current_term", self.ctx.current_term());
        self.metrics.gauge("commit_index", self.ctx.commit_index());
        self.metrics.gauge("last_applied", self.ctx.last_applied());
        self.metrics
            .gauge("pending_submissions", self.pending.len() as u64);
        self.metrics.gauge(
            "role",
            match self.roles.role() {
                Role::Follower => 0,
                Role::Candidate => 1,
                Role::Leader => 2,
            },
        );
    }
}
