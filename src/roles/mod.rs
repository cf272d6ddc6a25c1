//! The Follower/Candidate/Leader role machine: election timing, vote
//! solicitation, leader heartbeats and replication fan-out. Incoming-request
//! handling lives in `replication::handler`; this module reacts to what the
//! handlers observe and drives the outgoing side.

mod election;

pub use election::{CandidateTally, ElectionSchedule, ElectionTimer};

use crate::context::ReplicaContext;
use crate::error::ReplicorError;
use crate::events::ReplicaEvent;
use crate::storage::LogEntry;
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, PeerMessage, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::replication::{handler, AppliedCommand, ReplicationCursors};
use log::info;
use std::time::Instant;

/// Entries shipped per AppendEntries request; lagging followers catch up
/// over successive rounds.
const MAX_REPLICATION_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

/// Messages to send plus commands the apply loop executed along the way.
#[derive(Debug, Default)]
pub struct RoleOutput {
    pub outbound: Vec<Envelope>,
    pub applied: Vec<AppliedCommand>,
}

#[derive(Debug)]
pub struct RoleStateMachine {
    role: Role,
    schedule: ElectionSchedule,
    timer: ElectionTimer,
    tally: Option<CandidateTally>,
    cursors: ReplicationCursors,
    heartbeat_due: Option<Instant>,
    next_request_id: u64,
}

impl RoleStateMachine {
    pub fn new(window: (std::time::Duration, std::time::Duration), seed: u64, now: Instant) -> Self {
        let mut schedule = ElectionSchedule::new(window, seed);
        let timeout = schedule.next_timeout();
        Self {
            role: Role::Follower,
            schedule,
            timer: ElectionTimer::new(now, timeout),
            tally: None,
            cursors: ReplicationCursors::new(),
            heartbeat_due: None,
            next_request_id: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn election_deadline(&self) -> Instant {
        self.timer.deadline()
    }

    /// Re-arms the election timer; called on valid leader contact and on
    /// granting a vote.
    pub fn reset_election_timer(&mut self, now: Instant) {
        let timeout = self.schedule.next_timeout();
        self.timer.reset(now, timeout);
    }

    /// Drops back to Follower, discarding any candidacy or leadership
    /// state. Pending submissions are the engine's to cancel.
    pub fn step_down(&mut self, ctx: &mut ReplicaContext, now: Instant) {
        if self.role != Role::Follower {
            info!(
                "event=replica_role_change from={} to=follower term={}",
                self.role.label(),
                ctx.current_term()
            );
            ctx.events.publish(ReplicaEvent::RoleChange {
                term: ctx.current_term(),
                role: Role::Follower,
            });
        }
        self.role = Role::Follower;
        self.tally = None;
        self.cursors.clear();
        self.heartbeat_due = None;
        self.reset_election_timer(now);
    }

    /// Timer-driven work: election timeout for followers and candidates,
    /// heartbeat cadence for leaders.
    pub fn tick(
        &mut self,
        ctx: &mut ReplicaContext,
        now: Instant,
    ) -> Result<RoleOutput, ReplicorError> {
        match self.role {
            Role::Follower | Role::Candidate => {
                if self.timer.expired(now) {
                    self.start_election(ctx, now)
                } else {
                    Ok(RoleOutput::default())
                }
            }
            Role::Leader => {
                let due = self.heartbeat_due.map(|due| now >= due).unwrap_or(true);
                if due {
                    self.heartbeat_due = Some(now + ctx.config.heartbeat_interval());
                    Ok(RoleOutput {
                        outbound: self.replicate_all(ctx)?,
                        applied: Vec::new(),
                    })
                } else {
                    Ok(RoleOutput::default())
                }
            }
        }
    }

    /// Starts a new candidacy: bump the term, vote for ourselves through
    /// the regular vote handler, solicit everyone else.
    pub fn start_election(
        &mut self,
        ctx: &mut ReplicaContext,
        now: Instant,
    ) -> Result<RoleOutput, ReplicorError> {
        let term = ctx.current_term() + 1;
        ctx.advance_term(term)?;
        ctx.set_leader(None);
        if self.role != Role::Candidate {
            ctx.events.publish(ReplicaEvent::RoleChange {
                term,
                role: Role::Candidate,
            });
        }
        self.role = Role::Candidate;
        self.reset_election_timer(now);

        let local = ctx.cluster.local_member().to_string();
        let (last_log_term, last_log_index) = ctx.log.lock().last_entry_id();
        info!(
            "event=replica_election_start term={} candidate={} last_log_index={}",
            term, local, last_log_index
        );

        let self_request = RequestVoteRequest {
            id: self.next_id(),
            term,
            candidate: local.clone(),
            last_log_index,
            last_log_term,
        };
        let handled = handler::handle_request_vote(ctx, &self_request)?;
        let mut tally = CandidateTally::new(term);
        tally.record(local.clone(), handled.response.vote_granted);
        let reached = tally.reached(ctx.cluster.quorum());
        self.tally = Some(tally);
        if reached {
            return self.become_leader(ctx, now);
        }

        let mut outbound = Vec::new();
        for member in ctx.cluster.remote_members().clone() {
            outbound.push(Envelope {
                to: member,
                message: PeerMessage::RequestVote(RequestVoteRequest {
                    id: self.next_id(),
                    term,
                    candidate: local.clone(),
                    last_log_index,
                    last_log_term,
                }),
            });
        }
        Ok(RoleOutput {
            outbound,
            applied: Vec::new(),
        })
    }

    pub fn on_vote_response(
        &mut self,
        ctx: &mut ReplicaContext,
        from: &str,
        response: &RequestVoteResponse,
        now: Instant,
    ) -> Result<RoleOutput, ReplicorError> {
        if response.term > ctx.current_term() {
            ctx.advance_term(response.term)?;
            ctx.set_leader(None);
            self.step_down(ctx, now);
            return Ok(RoleOutput::default());
        }
        if self.role != Role::Candidate || response.term < ctx.current_term() {
            return Ok(RoleOutput::default());
        }
        let Some(tally) = self.tally.as_mut() else {
            return Ok(RoleOutput::default());
        };
        tally.record(from.to_string(), response.vote_granted);
        if tally.reached(ctx.cluster.quorum()) {
            return self.become_leader(ctx, now);
        }
        Ok(RoleOutput::default())
    }

    fn become_leader(
        &mut self,
        ctx: &mut ReplicaContext,
        now: Instant,
    ) -> Result<RoleOutput, ReplicorError> {
        let term = ctx.current_term();
        let local = ctx.cluster.local_member().to_string();
        info!(
            "event=replica_leader_elected term={} leader={}",
            term, local
        );
        self.role = Role::Leader;
        self.tally = None;
        ctx.events.publish(ReplicaEvent::RoleChange {
            term,
            role: Role::Leader,
        });
        ctx.set_leader(Some(local));

        // A NoOp stakes out the new leadership in the log.
        let noop_index = {
            let mut log = ctx.log.lock();
            let index = log.last_index() + 1;
            log.append(LogEntry::noop(term, index))?;
            index
        };
        self.cursors
            .reset(ctx.cluster.remote_members().iter().cloned(), noop_index);
        self.heartbeat_due = Some(now + ctx.config.heartbeat_interval());

        // A single-node cluster commits immediately.
        let mut output = self.leader_commit_advance(ctx)?;
        output.outbound = self.replicate_all(ctx)?;
        Ok(output)
    }

    /// Appends a client command on the leader and fans it out. Returns the
    /// entry's `(term, index)` so the caller can await its application.
    pub fn leader_append_command(
        &mut self,
        ctx: &mut ReplicaContext,
        name: &str,
        args: Vec<u8>,
    ) -> Result<(u64, u64, RoleOutput), ReplicorError> {
        debug_assert_eq!(self.role, Role::Leader);
        let term = ctx.current_term();
        let index = {
            let mut log = ctx.log.lock();
            let index = log.last_index() + 1;
            log.append(LogEntry::command(term, index, name, args))?;
            index
        };
        let mut output = self.leader_commit_advance(ctx)?;
        let mut fanout = self.replicate_all(ctx)?;
        output.outbound.append(&mut fanout);
        Ok((term, index, output))
    }

    pub fn on_append_response(
        &mut self,
        ctx: &mut ReplicaContext,
        from: &str,
        response: &AppendEntriesResponse,
        now: Instant,
    ) -> Result<RoleOutput, ReplicorError> {
        if response.term > ctx.current_term() {
            ctx.advance_term(response.term)?;
            ctx.set_leader(None);
            self.step_down(ctx, now);
            return Ok(RoleOutput::default());
        }
        if self.role != Role::Leader {
            return Ok(RoleOutput::default());
        }
        if response.success {
            let leader_last = ctx.log.lock().last_index();
            self.cursors
                .record_success(from, response.last_log_index, leader_last);
            self.leader_commit_advance(ctx)
        } else {
            self.cursors.record_conflict(from, response.last_log_index);
            let retry = self.replication_request(ctx, from);
            Ok(RoleOutput {
                outbound: retry.into_iter().collect(),
                applied: Vec::new(),
            })
        }
    }

    /// Commits the highest quorum-replicated index belonging to the current
    /// term, then drives the apply loop.
    fn leader_commit_advance(
        &mut self,
        ctx: &mut ReplicaContext,
    ) -> Result<RoleOutput, ReplicorError> {
        let leader_last = ctx.log.lock().last_index();
        let candidate = self
            .cursors
            .quorum_commit(leader_last, ctx.cluster.quorum());
        if candidate > ctx.commit_index
            && ctx.log.lock().term_at(candidate) == Some(ctx.current_term())
        {
            info!(
                "event=replica_commit_advance commit_index={} term={}",
                candidate,
                ctx.current_term()
            );
            let applied = handler::advance_commit(ctx, candidate);
            return Ok(RoleOutput {
                outbound: Vec::new(),
                applied,
            });
        }
        Ok(RoleOutput::default())
    }

    fn replicate_all(&mut self, ctx: &ReplicaContext) -> Result<Vec<Envelope>, ReplicorError> {
        let members: Vec<String> = ctx.cluster.remote_members().iter().cloned().collect();
        Ok(members
            .into_iter()
            .filter_map(|member| self.replication_request(ctx, &member))
            .collect())
    }

    /// Builds the AppendEntries request for one follower from its cursor.
    /// A follower behind the compaction point is served from `first_index`,
    /// where the snapshot run begins.
    fn replication_request(&mut self, ctx: &ReplicaContext, member: &str) -> Option<Envelope> {
        let cursor = self.cursors.cursor(member)?;
        let log = ctx.log.lock();
        let next = cursor.next_index.clamp(1, log.last_index() + 1);
        let next = if log.first_index() > 0 {
            next.min(log.last_index() + 1).max(log.first_index())
        } else {
            next
        };
        let prev_log_index = next - 1;
        let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
        let entries = log.entries_from(next, MAX_REPLICATION_BATCH);
        drop(log);
        Some(Envelope {
            to: member.to_string(),
            message: PeerMessage::AppendEntries(AppendEntriesRequest {
                id: self.next_id(),
                term: ctx.current_term(),
                leader_id: ctx.cluster.local_member().to_string(),
                prev_log_index,
                prev_log_term,
                entries,
                commit_index: ctx.commit_index,
            }),
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }
}
