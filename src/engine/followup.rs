//! Follow-up lookups derived from responses.
//!
//! A response can spawn a new lookup in three ways: the search list advances
//! after a non-zero rcode, a trace or NS search chases the name servers the
//! response offered, and a truncated UDP response retries over TCP. Every
//! follow-up is prepended to the engine's queue so chases proceed depth
//! first.

use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use tracing::debug;

use crate::engine::lookup::{Lookup, LookupSpec, Origin, SearchList};
use crate::engine::MXSERV;
use crate::nameserver::ServerSpec;

pub(crate) struct FollowupCtx<'a> {
    pub search: &'a SearchList,
    pub usesearch: bool,
}

/// Advances the origin to the next search entry. Only called for responses
/// with a non-zero rcode; a lookup whose origin was the fixed domain override
/// stops searching.
pub(crate) fn next_origin(lookup: &Lookup, ctx: &FollowupCtx<'_>) -> Option<LookupSpec> {
    let next = match lookup.origin() {
        Origin::None => return None,
        Origin::Fixed(_) => return None,
        Origin::Search(current) => current + 1,
    };
    if !ctx.usesearch || next >= ctx.search.entries().len() {
        return None;
    }
    debug!("Advancing search list to {}", ctx.search.entries()[next]);
    let mut spec = lookup.spec().clone();
    spec.origin = Origin::Search(next);
    spec.new_search = false;
    Some(spec)
}

/// Chases the name servers a trace or NS-search response offered. Chased
/// servers are dialed on `port`, the engine-wide port setting.
///
/// The ANSWER section is preferred, the AUTHORITY section is the delegation
/// case. When the NS records came from the ANSWER section the chain is
/// complete and the cloned lookup becomes a plain query against those
/// servers.
pub(crate) fn ns_chase(lookup: &Lookup, message: &Message, port: u16) -> Option<LookupSpec> {
    if !(lookup.spec().trace || lookup.spec().ns_search_only) {
        return None;
    }
    let (records, from_answer) = if !message.answers().is_empty() {
        (message.answers(), true)
    } else {
        (message.name_servers(), false)
    };
    let mut servers: Vec<ServerSpec> = records
        .iter()
        .filter_map(|rr| match rr.data() {
            RData::NS(ns) => Some(ServerSpec::from_name(ns.0.to_utf8(), port)),
            _ => None,
        })
        .collect();
    if servers.is_empty() {
        return None;
    }
    if lookup.spec().trace_root {
        servers.truncate(MXSERV);
    }
    debug!("Chasing {} name servers", servers.len());

    let mut spec = lookup.spec().clone();
    spec.servers = servers;
    spec.trace_root = false;
    spec.new_search = false;
    if from_answer {
        spec.trace = false;
        spec.ns_search_only = false;
    }
    Some(spec)
}

/// Re-queues the lookup over TCP after a truncated UDP response.
pub(crate) fn tcp_retry(lookup: &Lookup) -> LookupSpec {
    let mut spec = lookup.spec().clone();
    spec.tcp_mode = true;
    spec.new_search = false;
    spec.origin = lookup.origin().clone();
    spec
}

/// Re-queues a timed-out TCP lookup, consuming one attempt.
pub(crate) fn tcp_requeue(lookup: &Lookup) -> LookupSpec {
    let mut spec = tcp_retry(lookup);
    spec.retries = lookup.retries().saturating_sub(1);
    spec
}
