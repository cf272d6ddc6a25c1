//! Inbound request handlers. Each handler produces its reply plus a
//! `step_down` flag; the caller must emit the reply before acting on the
//! flag so the responding term is always the term that decided the outcome.

use crate::context::ReplicaContext;
use crate::error::ReplicorError;
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SubmitCommandRequest, SubmitCommandResponse,
};
use crate::replication::apply::{apply_committed, AppliedCommand};
use crate::snapshot;
use log::warn;
use std::sync::Arc;

/// A handler's reply together with the transition it armed and the
/// commands the apply loop executed while producing it.
#[derive(Debug)]
pub struct Handled<R> {
    pub response: R,
    pub step_down: bool,
    pub applied: Vec<AppliedCommand>,
}

pub fn handle_append_entries(
    ctx: &mut ReplicaContext,
    req: &AppendEntriesRequest,
) -> Result<Handled<AppendEntriesResponse>, ReplicorError> {
    // A greater term, or an equal term while no leader is known, makes the
    // sender the leader of record and arms a post-reply step-down.
    let mut step_down = false;
    if req.term > ctx.current_term()
        || (req.term == ctx.current_term() && ctx.current_leader().is_none())
    {
        ctx.advance_term(req.term)?;
        ctx.set_leader(Some(req.leader_id.clone()));
        step_down = true;
    }

    if req.term < ctx.current_term() {
        warn!(
            "event=replica_append_reject reason=stale_term request_term={} current_term={} leader={}",
            req.term,
            ctx.current_term(),
            req.leader_id
        );
        return Ok(Handled {
            response: reply(ctx, req.id, false),
            step_down,
            applied: Vec::new(),
        });
    }

    if req.prev_log_index > 0 && req.prev_log_term > 0 {
        let log = ctx.log.lock();
        let matches = match log.entry(req.prev_log_index) {
            _ if req.prev_log_index > log.last_index() => false,
            Some(entry) => entry.term == req.prev_log_term,
            None => false,
        };
        if !matches {
            warn!(
                "event=replica_append_reject reason=prev_entry_mismatch prev_log_index={} prev_log_term={} last_index={}",
                req.prev_log_index,
                req.prev_log_term,
                log.last_index()
            );
            drop(log);
            return Ok(Handled {
                response: reply(ctx, req.id, false),
                step_down,
                applied: Vec::new(),
            });
        }
    }

    append_entries(ctx, req)?;
    let applied = advance_commit(ctx, req.commit_index);

    Ok(Handled {
        response: reply(ctx, req.id, true),
        step_down,
        applied,
    })
}

/// Appends the request entries, truncating the local suffix at the first
/// term conflict.
fn append_entries(ctx: &mut ReplicaContext, req: &AppendEntriesRequest) -> Result<(), ReplicorError> {
    let log_handle = Arc::clone(&ctx.log);
    let mut log = log_handle.lock();
    for (offset, entry) in req.entries.iter().enumerate() {
        let slot = req.prev_log_index + offset as u64 + 1;
        match log.entry(slot) {
            Some(local) if local.term != entry.term => {
                warn!(
                    "event=replica_append_truncate index={} local_term={} incoming_term={}",
                    slot, local.term, entry.term
                );
                log.remove_after(slot - 1)?;
                log.append_batch(&req.entries[offset..])?;
                break;
            }
            Some(_) => continue,
            None => {
                log.append_batch(&req.entries[offset..])?;
                break;
            }
        }
    }
    Ok(())
}

/// Advances `commit_index` toward the leader's and drives the apply loop.
/// Also re-enters the loop when a previous apply round fell short.
pub(crate) fn advance_commit(ctx: &mut ReplicaContext, leader_commit: u64) -> Vec<AppliedCommand> {
    if leader_commit <= ctx.commit_index && ctx.commit_index <= ctx.last_applied {
        return Vec::new();
    }
    let last_index = ctx.log.lock().last_index();
    ctx.commit_index = leader_commit.max(ctx.commit_index).min(last_index);
    if ctx.commit_index <= ctx.last_applied {
        return Vec::new();
    }
    let applied = apply_committed(ctx);
    snapshot::maybe_compact(ctx);
    applied
}

fn reply(ctx: &ReplicaContext, id: u64, success: bool) -> AppendEntriesResponse {
    AppendEntriesResponse {
        id,
        term: ctx.current_term(),
        success,
        last_log_index: ctx.log.lock().last_index(),
    }
}

pub fn handle_request_vote(
    ctx: &mut ReplicaContext,
    req: &RequestVoteRequest,
) -> Result<Handled<RequestVoteResponse>, ReplicorError> {
    let mut step_down = false;
    if req.term > ctx.current_term() {
        ctx.advance_term(req.term)?;
        ctx.set_leader(None);
        step_down = true;
    }

    let local = ctx.cluster.local_member().to_string();
    let vote_granted = if req.term < ctx.current_term() {
        deny(ctx, req, "stale_term");
        false
    } else if req.candidate == local {
        // Candidates solicit themselves through this handler.
        ctx.record_vote(&local)?;
        true
    } else if !ctx.cluster.contains(&req.candidate) {
        deny(ctx, req, "unknown_candidate");
        false
    } else if ctx
        .voted_for()
        .map_or(true, |voted| voted == req.candidate)
    {
        let (last_log_term, last_log_index) = ctx.log.lock().last_entry_id();
        if last_log_index == 0 {
            ctx.record_vote(&req.candidate)?;
            true
        } else if req.last_log_index >= last_log_index && req.last_log_term >= last_log_term {
            ctx.record_vote(&req.candidate)?;
            true
        } else {
            ctx.clear_vote()?;
            deny(ctx, req, "log_behind");
            false
        }
    } else {
        deny(ctx, req, "already_voted");
        false
    };

    Ok(Handled {
        response: RequestVoteResponse {
            id: req.id,
            term: ctx.current_term(),
            vote_granted,
        },
        step_down,
        applied: Vec::new(),
    })
}

fn deny(ctx: &ReplicaContext, req: &RequestVoteRequest, reason: &str) {
    warn!(
        "event=replica_vote_denied reason={} candidate={} request_term={} current_term={} voted_for={:?}",
        reason,
        req.candidate,
        req.term,
        ctx.current_term(),
        ctx.voted_for()
    );
}

/// Immediate rejection for SubmitCommand on a replica that is not leading.
pub fn reject_not_leader(req: &SubmitCommandRequest) -> SubmitCommandResponse {
    SubmitCommandResponse::error(req.id, "Not the leader")
}
