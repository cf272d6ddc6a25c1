//! Multi-replica election and submission scenarios over an in-memory
//! router. Time is explicit; only the replica named in each step is ticked,
//! so every schedule is deterministic.

use replicor::{
    ClusterView, EngineConfig, Envelope, JsonSnapshotCodec, KvStateMachine, PeerMessage,
    ReplicaEngine, RequestVoteRequest, Role, StateMachine, SubmitCommandRequest,
    SubmitCommandResponse, SubmitOutcome,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Cluster {
    engines: BTreeMap<String, ReplicaEngine>,
    client_replies: Vec<(String, SubmitCommandResponse)>,
}

impl Cluster {
    fn new(tmp: &TempDir, members: &[&str], start: Instant) -> Self {
        let mut engines = BTreeMap::new();
        for (offset, id) in members.iter().enumerate() {
            let remotes = members
                .iter()
                .filter(|member| *member != id)
                .map(|member| member.to_string());
            engines.insert(
                id.to_string(),
                ReplicaEngine::open(
                    EngineConfig::default(),
                    ClusterView::new(*id, remotes),
                    &tmp.path().join(id),
                    Box::new(KvStateMachine::new()),
                    Box::new(JsonSnapshotCodec),
                    (offset as u64 + 1) * 17,
                    start,
                )
                .unwrap(),
            );
        }
        Self {
            engines,
            client_replies: Vec::new(),
        }
    }

    /// Delivers messages until the network is quiet. Envelopes addressed to
    /// unknown ids are client replies.
    fn dispatch(&mut self, from: &str, outbound: Vec<Envelope>, now: Instant) {
        let mut queue: VecDeque<(String, Envelope)> = outbound
            .into_iter()
            .map(|envelope| (from.to_string(), envelope))
            .collect();
        while let Some((sender, envelope)) = queue.pop_front() {
            match self.engines.get_mut(&envelope.to) {
                Some(engine) => {
                    let receiver = envelope.to.clone();
                    let replies = engine.handle_message(&sender, envelope.message, now);
                    queue.extend(
                        replies
                            .into_iter()
                            .map(|envelope| (receiver.clone(), envelope)),
                    );
                }
                None => {
                    if let PeerMessage::SubmitCommandReply(response) = envelope.message {
                        self.client_replies.push((envelope.to, response));
                    }
                }
            }
        }
    }

    fn tick(&mut self, id: &str, now: Instant) {
        let outbound = self.engines.get_mut(id).unwrap().tick(now);
        self.dispatch(id, outbound, now);
    }

    fn submit(&mut self, leader: &str, client: &str, request: SubmitCommandRequest, now: Instant) {
        let outbound = self.engines.get_mut(leader).unwrap().handle_message(
            client,
            PeerMessage::SubmitCommand(request),
            now,
        );
        self.dispatch(leader, outbound, now);
    }

    fn leaders(&self) -> Vec<&str> {
        self.engines
            .iter()
            .filter(|(_, engine)| engine.role() == Role::Leader)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    fn engine(&self, id: &str) -> &ReplicaEngine {
        &self.engines[id]
    }
}

fn put_request(id: u64, key: &str, value: &str) -> SubmitCommandRequest {
    SubmitCommandRequest {
        id,
        command: "put".into(),
        args: serde_json::to_vec(&serde_json::json!({ "key": key, "value": value })).unwrap(),
    }
}

#[test]
fn first_timeout_elects_exactly_one_leader() {
    let tmp = TempDir::new().unwrap();
    let start = Instant::now();
    let mut cluster = Cluster::new(&tmp, &["a", "b", "c"], start);

    cluster.tick("a", start + Duration::from_millis(400));

    assert_eq!(cluster.leaders(), vec!["a"]);
    assert_eq!(cluster.engine("a").current_term(), 1);
    for id in ["b", "c"] {
        assert_eq!(cluster.engine(id).role(), Role::Follower);
        assert_eq!(cluster.engine(id).current_term(), 1);
        assert_eq!(cluster.engine(id).leader_hint().as_deref(), Some("a"));
        assert_eq!(cluster.engine(id).context().voted_for(), Some("a"));
    }
    // The leadership noop commits once a quorum acknowledged it.
    assert_eq!(cluster.engine("a").commit_index(), 1);

    // Followers learn the commit index with the next heartbeat.
    cluster.tick("a", start + Duration::from_millis(460));
    for id in ["b", "c"] {
        assert_eq!(cluster.engine(id).commit_index(), 1);
        assert_eq!(cluster.engine(id).last_applied(), 1);
    }
}

#[test]
fn voters_grant_at_most_once_per_term() {
    let tmp = TempDir::new().unwrap();
    let start = Instant::now();
    let mut cluster = Cluster::new(&tmp, &["a", "b", "c"], start);
    cluster.tick("a", start + Duration::from_millis(400));
    assert_eq!(cluster.engine("b").context().voted_for(), Some("a"));

    // A rival candidacy in the same term gets nothing from b.
    let outbound = cluster.engines.get_mut("b").unwrap().handle_message(
        "c",
        PeerMessage::RequestVote(RequestVoteRequest {
            id: 99,
            term: 1,
            candidate: "c".into(),
            last_log_index: 1,
            last_log_term: 1,
        }),
        start + Duration::from_millis(410),
    );
    let reply = outbound
        .iter()
        .find_map(|envelope| match &envelope.message {
            PeerMessage::RequestVoteReply(response) => Some(response),
            _ => None,
        })
        .expect("a vote reply");
    assert!(!reply.vote_granted);
    assert_eq!(cluster.engine("b").context().voted_for(), Some("a"));
}

#[test]
fn submissions_round_trip_through_the_leader() {
    let tmp = TempDir::new().unwrap();
    let start = Instant::now();
    let mut cluster = Cluster::new(&tmp, &["a", "b", "c"], start);
    cluster.tick("a", start + Duration::from_millis(400));

    cluster.submit(
        "a",
        "client-1",
        put_request(21, "color", "teal"),
        start + Duration::from_millis(420),
    );
    let (client, response) = cluster.client_replies.pop().expect("a client reply");
    assert_eq!(client, "client-1");
    assert_eq!(response.id, 21);
    assert_eq!(response.outcome, SubmitOutcome::Result(Vec::new()));

    // Propagate the commit, then every machine agrees.
    cluster.tick("a", start + Duration::from_millis(470));
    for id in ["a", "b", "c"] {
        let document = cluster
            .engine(id)
            .context()
            .machine()
            .take_snapshot()
            .unwrap();
        assert_eq!(document["color"], "teal", "replica {id} diverged");
    }
}

#[test]
fn a_higher_term_takes_leadership_and_cancels_pending_submissions() {
    let tmp = TempDir::new().unwrap();
    let start = Instant::now();
    let mut cluster = Cluster::new(&tmp, &["a", "b", "c"], start);
    cluster.tick("a", start + Duration::from_millis(400));
    cluster.tick("a", start + Duration::from_millis(460));
    assert_eq!(cluster.leaders(), vec!["a"]);

    // The leader accepts a submission whose replication we never deliver.
    let stranded = cluster.engines.get_mut("a").unwrap().handle_message(
        "client-7",
        PeerMessage::SubmitCommand(put_request(7, "k", "v")),
        start + Duration::from_millis(470),
    );
    assert!(stranded
        .iter()
        .all(|envelope| !matches!(envelope.message, PeerMessage::SubmitCommandReply(_))));

    // b times out without hearing another heartbeat and runs for term 2.
    cluster.tick("b", start + Duration::from_millis(900));

    assert_eq!(cluster.leaders(), vec!["b"]);
    assert_eq!(cluster.engine("b").current_term(), 2);
    assert_eq!(cluster.engine("a").role(), Role::Follower);

    let (client, response) = cluster.client_replies.pop().expect("a cancellation");
    assert_eq!(client, "client-7");
    assert_eq!(
        response.outcome,
        SubmitOutcome::Error("leadership lost".into())
    );

    // The committed leadership noop of term 1 survives the change.
    for id in ["a", "b", "c"] {
        let log = cluster.engine(id).context().log().lock();
        assert_eq!(log.term_at(1), Some(1), "replica {id} lost a committed entry");
    }
}
