//! State machine seam. The engine treats the machine as opaque: commands go
//! in, result bytes come out, and snapshots travel as a JSON document so the
//! injected codec can carry them without knowing the machine's shape.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub trait StateMachine: Send {
    /// Applies a committed command. The returned bytes complete the
    /// submitting client's request on the leader.
    fn apply_command(&mut self, name: &str, args: &[u8]) -> Result<Vec<u8>, StateMachineError>;

    /// Captures the full machine state as a document.
    fn take_snapshot(&self) -> Result<Value, StateMachineError>;

    /// Replaces the machine state with a previously captured document.
    fn install_snapshot(&mut self, document: Value) -> Result<(), StateMachineError>;
}

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed arguments: {0}")]
    MalformedArguments(#[from] serde_json::Error),
    #[error("malformed snapshot document")]
    MalformedSnapshot,
    #[error("{0}")]
    Other(String),
}

/// Serializes a state-machine document to replicable bytes and back.
/// Injected through the context; the engine carries no global serializer.
pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, document: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Default codec: compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSnapshotCodec;

impl SnapshotCodec for JsonSnapshotCodec {
    fn encode(&self, document: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(document)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Small string key/value machine used by tests and demos. Commands:
/// `put {"key","value"}` (returns the previous value, if any),
/// `get {"key"}`, `delete {"key"}` (returns the removed value, if any).
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
}

#[derive(Debug, serde::Deserialize)]
struct KvArgs {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KvStateMachine {
    fn apply_command(&mut self, name: &str, args: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        let args: KvArgs = serde_json::from_slice(args)?;
        let reply = match name {
            "put" => {
                let value = args.value.unwrap_or_default();
                self.data.insert(args.key, value)
            }
            "get" => self.data.get(&args.key).cloned(),
            "delete" => self.data.remove(&args.key),
            other => return Err(StateMachineError::UnknownCommand(other.to_string())),
        };
        Ok(reply.map(String::into_bytes).unwrap_or_default())
    }

    fn take_snapshot(&self) -> Result<Value, StateMachineError> {
        serde_json::to_value(&self.data).map_err(StateMachineError::from)
    }

    fn install_snapshot(&mut self, document: Value) -> Result<(), StateMachineError> {
        self.data =
            serde_json::from_value(document).map_err(|_| StateMachineError::MalformedSnapshot)?;
        Ok(())
    }
}
