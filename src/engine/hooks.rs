//! Output callbacks of the engine.
//!
//! The engine never formats DNS data itself. A driver, e.g. the CLI binary,
//! implements [`EngineHooks`] and renders answers, per-message output for
//! traces and zone transfers, and the post-response trailer (server, RTT,
//! message size) from what it is handed here.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hickory_proto::op::Message;
use hickory_proto::rr::Name;
use serde::Serialize;

use crate::engine::lookup::Lookup;
use crate::engine::query::Query;
use crate::utils::serialize::ser_to_string;

/// Reporting data for one received message, enough for a driver to print the
/// dig-style `SERVER`/`Query time`/`WHEN`/`MSG SIZE` trailer.
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedInfo {
    #[serde(serialize_with = "ser_to_string")]
    pub from: SocketAddr,
    pub bytes: usize,
    pub rtt: Option<Duration>,
    pub when: DateTime<Utc>,
}

/// Callbacks the driver provides. All implementations default to no-ops, so a
/// driver only implements what it prints.
pub trait EngineHooks: Send + Sync {
    /// A lookup is about to fire its first query.
    fn on_trying(&self, _name: &Name, _lookup: &Lookup) {}

    /// A message passed all gates and is surfaced. Called once per answer,
    /// once per delegation step in a trace, and once per inbound message of a
    /// zone transfer.
    fn on_message(&self, _query: &Query, _message: &Message) {}

    /// Raw bytes arrived from a server. Also called for responses that failed
    /// to parse when `best_effort` is set.
    fn on_received(&self, _payload: &[u8], _info: &ReceivedInfo) {}

    /// The engine drained its queue and stopped.
    fn on_shutdown(&self) {}
}

/// Discards all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}
