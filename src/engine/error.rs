use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize)]
/// Error type of the query engine.
///
/// Must be `Send` because it used by async function which might run on different threads.
pub enum Error {
    #[error("connection timed out; no servers could be reached")]
    NoServers,
    #[error("'{name}' is not a legal name: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("protocol error: {reason}")]
    ProtoError { reason: String },
    #[error("failed to parse response: {reason}")]
    ParseError { reason: String },
    #[error("message length {length} exceeds the receive buffer of {limit} octets")]
    OversizedMessage { length: usize, limit: usize },
    #[error("zone transfer failed: {reason}")]
    TransferFailed { reason: String },
    #[error("record limit reached, {count} records transferred")]
    RecordLimit { count: usize },
    #[error("too many lookups, limit of {limit} exceeded")]
    LookupLimit { limit: usize },
    #[error("lookup has been cancelled")]
    Cancelled,
    #[error("transport error: {reason}")]
    Transport { reason: String },
}

impl From<hickory_proto::ProtoError> for Error {
    fn from(error: hickory_proto::ProtoError) -> Self {
        Error::ProtoError {
            reason: error.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Transport {
            reason: error.to_string(),
        }
    }
}

impl From<hickory_proto::dnssec::DnsSecError> for Error {
    fn from(error: hickory_proto::dnssec::DnsSecError) -> Self {
        Error::ProtoError {
            reason: error.to_string(),
        }
    }
}
