//! Peer protocol records and their frame codec. The engine consumes the
//! decoded records; the framing exists so a transport can carry them without
//! knowing their shape. Frames are versioned, little-endian, with
//! length-prefixed variable fields. Log entries travel as length-prefixed
//! JSON records, the same encoding the log store persists.

use crate::storage::LogEntry;
use std::convert::TryInto;
use std::str::from_utf8;
use thiserror::Error;

const APPEND_ENTRIES_VERSION: u8 = 1;
const REQUEST_VOTE_VERSION: u8 = 1;
const SUBMIT_COMMAND_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub id: u64,
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

impl AppendEntriesRequest {
    /// An empty request: the leader's liveness signal.
    pub fn heartbeat(id: u64, term: u64, leader_id: impl Into<String>, commit_index: u64) -> Self {
        Self {
            id,
            term,
            leader_id: leader_id.into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            commit_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub id: u64,
    pub term: u64,
    pub success: bool,
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    pub id: u64,
    pub term: u64,
    pub candidate: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub id: u64,
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommandRequest {
    pub id: u64,
    pub command: String,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommandResponse {
    pub id: u64,
    pub outcome: SubmitOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Result(Vec<u8>),
    Error(String),
}

impl SubmitCommandResponse {
    pub fn result(id: u64, bytes: Vec<u8>) -> Self {
        Self {
            id,
            outcome: SubmitOutcome::Result(bytes),
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: SubmitOutcome::Error(message.into()),
        }
    }
}

/// Any message a replica can receive or emit, for transports and routers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesReply(AppendEntriesResponse),
    RequestVote(RequestVoteRequest),
    RequestVoteReply(RequestVoteResponse),
    SubmitCommand(SubmitCommandRequest),
    SubmitCommandReply(SubmitCommandResponse),
}

/// An outbound message addressed to a member or client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: String,
    pub message: PeerMessage,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short")]
    Truncated,
    #[error("unsupported version {observed} (expected {expected})")]
    InvalidVersion { observed: u8, expected: u8 },
    #[error("{field} too long ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("entry record error: {0}")]
    Entry(#[from] serde_json::Error),
    #[error("unknown message tag {0}")]
    UnknownMessageTag(u8),
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        let byte = *self.bytes.get(self.cursor).ok_or(FrameError::Truncated)?;
        self.cursor += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.bytes.len() < self.cursor + len {
            return Err(FrameError::Truncated);
        }
        let slice = &self.bytes[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    fn str(&mut self, field: &'static str) -> Result<&'a str, FrameError> {
        let len = self.u16()? as usize;
        from_utf8(self.take(len)?).map_err(|_| FrameError::InvalidUtf8 { field })
    }
}

fn put_str(buf: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), FrameError> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(FrameError::FieldTooLong {
            field,
            len: bytes.len(),
        });
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_bytes(buf: &mut Vec<u8>, field: &'static str, value: &[u8]) -> Result<(), FrameError> {
    if value.len() > u32::MAX as usize {
        return Err(FrameError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

fn check_version(observed: u8, expected: u8) -> Result<(), FrameError> {
    if observed != expected {
        return Err(FrameError::InvalidVersion { observed, expected });
    }
    Ok(())
}

impl AppendEntriesRequest {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.entries.len() > u16::MAX as usize {
            return Err(FrameError::FieldTooLong {
                field: "entries",
                len: self.entries.len(),
            });
        }
        let mut buf = Vec::with_capacity(64);
        buf.push(APPEND_ENTRIES_VERSION);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_index.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_term.to_le_bytes());
        buf.extend_from_slice(&self.commit_index.to_le_bytes());
        put_str(&mut buf, "leader_id", &self.leader_id)?;
        buf.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for entry in &self.entries {
            let record = serde_json::to_vec(entry)?;
            put_bytes(&mut buf, "entry", &record)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(bytes);
        check_version(reader.u8()?, APPEND_ENTRIES_VERSION)?;
        let id = reader.u64()?;
        let term = reader.u64()?;
        let prev_log_index = reader.u64()?;
        let prev_log_term = reader.u64()?;
        let commit_index = reader.u64()?;
        let leader_id = reader.str("leader_id")?.to_string();
        let count = reader.u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let len = reader.u32()? as usize;
            entries.push(serde_json::from_slice(reader.take(len)?)?);
        }
        Ok(Self {
            id,
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
        })
    }
}

impl AppendEntriesResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(APPEND_ENTRIES_VERSION);
        buf.push(self.success as u8);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.last_log_index.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(bytes);
        check_version(reader.u8()?, APPEND_ENTRIES_VERSION)?;
        let success = reader.u8()? & 0x01 == 0x01;
        Ok(Self {
            id: reader.u64()?,
            term: reader.u64()?,
            success,
            last_log_index: reader.u64()?,
        })
    }
}

impl RequestVoteRequest {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(48);
        buf.push(REQUEST_VOTE_VERSION);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.last_log_index.to_le_bytes());
        buf.extend_from_slice(&self.last_log_term.to_le_bytes());
        put_str(&mut buf, "candidate", &self.candidate)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(bytes);
        check_version(reader.u8()?, REQUEST_VOTE_VERSION)?;
        let id = reader.u64()?;
        let term = reader.u64()?;
        let last_log_index = reader.u64()?;
        let last_log_term = reader.u64()?;
        let candidate = reader.str("candidate")?.to_string();
        Ok(Self {
            id,
            term,
            candidate,
            last_log_index,
            last_log_term,
        })
    }
}

impl RequestVoteResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.push(REQUEST_VOTE_VERSION);
        buf.push(self.vote_granted as u8);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(bytes);
        check_version(reader.u8()?, REQUEST_VOTE_VERSION)?;
        let vote_granted = reader.u8()? & 0x01 == 0x01;
        Ok(Self {
            id: reader.u64()?,
            term: reader.u64()?,
            vote_granted,
        })
    }
}

impl SubmitCommandRequest {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(32 + self.args.len());
        buf.push(SUBMIT_COMMAND_VERSION);
        buf.extend_from_slice(&self.id.to_le_bytes());
        put_str(&mut buf, "command", &self.command)?;
        put_bytes(&mut buf, "args", &self.args)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(bytes);
        check_version(reader.u8()?, SUBMIT_COMMAND_VERSION)?;
        let id = reader.u64()?;
        let command = reader.str("command")?.to_string();
        let len = reader.u32()? as usize;
        let args = reader.take(len)?.to_vec();
        Ok(Self { id, command, args })
    }
}

impl SubmitCommandResponse {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(32);
        buf.push(SUBMIT_COMMAND_VERSION);
        buf.extend_from_slice(&self.id.to_le_bytes());
        match &self.outcome {
            SubmitOutcome::Result(bytes) => {
                buf.push(0x01);
                put_bytes(&mut buf, "result", bytes)?;
            }
            SubmitOutcome::Error(message) => {
                buf.push(0x00);
                put_str(&mut buf, "error", message)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(bytes);
        check_version(reader.u8()?, SUBMIT_COMMAND_VERSION)?;
        let id = reader.u64()?;
        let outcome = match reader.u8()? {
            0x01 => {
                let len = reader.u32()? as usize;
                SubmitOutcome::Result(reader.take(len)?.to_vec())
            }
            _ => SubmitOutcome::Error(reader.str("error")?.to_string()),
        };
        Ok(Self { id, outcome })
    }
}

impl PeerMessage {
    fn tag(&self) -> u8 {
        match self {
            PeerMessage::AppendEntries(_) => 1,
            PeerMessage::AppendEntriesReply(_) => 2,
            PeerMessage::RequestVote(_) => 3,
            PeerMessage::RequestVoteReply(_) => 4,
            PeerMessage::SubmitCommand(_) => 5,
            PeerMessage::SubmitCommandReply(_) => 6,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let body = match self {
            PeerMessage::AppendEntries(request) => request.encode()?,
            PeerMessage::AppendEntriesReply(response) => response.encode(),
            PeerMessage::RequestVote(request) => request.encode()?,
            PeerMessage::RequestVoteReply(response) => response.encode(),
            PeerMessage::SubmitCommand(request) => request.encode()?,
            PeerMessage::SubmitCommandReply(response) => response.encode()?,
        };
        let mut buf = Vec::with_capacity(body.len() + 1);
        buf.push(self.tag());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (tag, body) = bytes.split_first().ok_or(FrameError::Truncated)?;
        Ok(match tag {
            1 => PeerMessage::AppendEntries(AppendEntriesRequest::decode(body)?),
            2 => PeerMessage::AppendEntriesReply(AppendEntriesResponse::decode(body)?),
            3 => PeerMessage::RequestVote(RequestVoteRequest::decode(body)?),
            4 => PeerMessage::RequestVoteReply(RequestVoteResponse::decode(body)?),
            5 => PeerMessage::SubmitCommand(SubmitCommandRequest::decode(body)?),
            6 => PeerMessage::SubmitCommandReply(SubmitCommandResponse::decode(body)?),
            other => return Err(FrameError::UnknownMessageTag(*other)),
        })
    }
}
