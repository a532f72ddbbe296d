//! Per-lookup transport drivers.
//!
//! One lookup is driven at a time. The UDP driver walks the server list on a
//! rotation timer, keeps earlier receives posted while later servers are
//! tried, and consumes one retry whenever the whole list has been walked.
//! The TCP driver dials one server at a time and runs the length-framed
//! receive loop, which for zone transfers spans many messages on one stream.

use std::io;
use std::net::SocketAddr;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use hickory_proto::op::{Message, ResponseCode};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::engine::followup::{self, FollowupCtx};
use crate::engine::hooks::ReceivedInfo;
use crate::engine::lookup::{Lookup, LookupSpec};
use crate::engine::response::{apply_gates, Gate};
use crate::engine::transport::{self, query_timeout, RecvError, TcpChannel, UdpChannel};
use crate::engine::xfr::{Progress, XfrTracker};
use crate::engine::DriveCtx;
use crate::nameserver::family_matches;

#[derive(Debug)]
pub(crate) enum Disposition {
    /// A response was surfaced through the hooks.
    Answered,
    /// The lookup was replaced by its follow-ups; nothing was surfaced.
    Moved,
    /// Cancelled from outside; never reported upward.
    Canceled,
    /// Every server timed out, refused, or was unusable.
    NoServers,
    /// A zone transfer hit the record limit.
    RecordLimit { count: usize },
    /// A zone transfer stream was malformed.
    TransferFailed { reason: String },
    /// The response could not be parsed and best effort was off.
    ParseFailed,
    /// Unrecoverable transport state, e.g. a length prefix beyond the buffer.
    Fatal { reason: String },
}

#[derive(Debug)]
pub(crate) struct Outcome {
    pub disposition: Disposition,
    pub followups: Vec<LookupSpec>,
}

impl Outcome {
    fn of(disposition: Disposition) -> Outcome {
        Outcome {
            disposition,
            followups: Vec::new(),
        }
    }

    fn moved(followups: Vec<LookupSpec>) -> Outcome {
        Outcome {
            disposition: Disposition::Moved,
            followups,
        }
    }
}

pub(crate) async fn drive_lookup(ctx: &DriveCtx<'_>, lookup: &mut Lookup) -> Outcome {
    if lookup.tcp_mode() {
        drive_tcp(ctx, lookup).await
    } else {
        drive_udp(ctx, lookup).await
    }
}

type RecvResult = (usize, io::Result<(Vec<u8>, SocketAddr)>);

/// Per-server transport state of the UDP driver: the open socket, if any,
/// and whether a receive is currently posted on it.
#[derive(Debug, Default)]
struct UdpSlot {
    channel: Option<UdpChannel>,
    recv_outstanding: bool,
}

async fn drive_udp(ctx: &DriveCtx<'_>, lookup: &mut Lookup) -> Outcome {
    let server_count = lookup.queries().len();
    let mut slots: Vec<UdpSlot> = Vec::new();
    slots.resize_with(server_count, UdpSlot::default);
    let mut inflight: FuturesUnordered<BoxFuture<'static, RecvResult>> = FuturesUnordered::new();

    let mut cursor = match start_udp(ctx, lookup, &mut slots, &mut inflight, 0).await {
        Some(started) => started,
        None => return Outcome::of(Disposition::NoServers),
    };
    if lookup.spec().ns_search_only {
        // NS searches fan out to every server immediately
        let mut next = cursor + 1;
        while next < server_count {
            match start_udp(ctx, lookup, &mut slots, &mut inflight, next).await {
                Some(started) => next = started + 1,
                None => break,
            }
        }
    }

    loop {
        if ctx.cancel.is_cancelled() {
            return Outcome::of(Disposition::Canceled);
        }
        let has_successor = cursor + 1 < server_count;
        let wait = query_timeout(false, false, lookup.spec().timeout, has_successor);

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Outcome::of(Disposition::Canceled),
            received = inflight.next(), if !inflight.is_empty() => {
                let Some((ix, result)) = received else { continue };
                slots[ix].recv_outstanding = false;
                match result {
                    Ok((payload, from)) => {
                        match apply_gates(lookup, &payload) {
                            Gate::Discard(reason) => {
                                debug!("Discarding response from {}: {}", from, reason);
                                rearm_udp(ctx, &mut slots, ix, &mut inflight);
                            }
                            Gate::BestEffort => {
                                report_received(ctx, lookup, ix, &payload, from);
                                return Outcome::of(Disposition::Answered);
                            }
                            Gate::ParseFailed(_) => return Outcome::of(Disposition::ParseFailed),
                            Gate::TcpRetry => return Outcome::moved(vec![followup::tcp_retry(lookup)]),
                            Gate::NextServer(message) => {
                                warn!("Got SERVFAIL reply from {}, trying next server", lookup.queries()[ix].server());
                                report_received(ctx, lookup, ix, &payload, from);
                                match start_udp(ctx, lookup, &mut slots, &mut inflight, cursor + 1).await {
                                    Some(started) if has_successor => cursor = started,
                                    _ => return conclude(ctx, lookup, ix, *message),
                                }
                            }
                            Gate::Accept(message) => {
                                report_received(ctx, lookup, ix, &payload, from);
                                return conclude(ctx, lookup, ix, *message);
                            }
                        }
                    }
                    Err(e) => {
                        // e.g. ICMP port unreachable surfacing as ECONNREFUSED
                        warn!("Receive on {} failed: {}", lookup.queries()[ix].server(), e);
                        slots[ix].channel = None;
                    }
                }
            }
            _ = sleep(wait) => {
                if has_successor {
                    debug!("Trying next server");
                    match start_udp(ctx, lookup, &mut slots, &mut inflight, cursor + 1).await {
                        Some(started) => cursor = started,
                        None => match retry_from_head(ctx, lookup, &mut slots, &mut inflight).await {
                            Some(started) => cursor = started,
                            None => return Outcome::of(Disposition::NoServers),
                        },
                    }
                } else {
                    match retry_from_head(ctx, lookup, &mut slots, &mut inflight).await {
                        Some(started) => cursor = started,
                        None => return Outcome::of(Disposition::NoServers),
                    }
                }
            }
        }
    }
}

/// Consumes one retry and resends to the head of the server list. `None`
/// means the lookup is out of attempts or out of reachable servers.
async fn retry_from_head(
    ctx: &DriveCtx<'_>,
    lookup: &mut Lookup,
    slots: &mut Vec<UdpSlot>,
    inflight: &mut FuturesUnordered<BoxFuture<'static, RecvResult>>,
) -> Option<usize> {
    if lookup.retries() <= 1 {
        return None;
    }
    lookup.dec_retries();
    debug!("Resending UDP request to first server, {} tries left", lookup.retries());
    start_udp(ctx, lookup, slots, inflight, 0).await
}

/// Starts the first usable query at or after `from`: resolves the server,
/// applies the address-family filter, opens or reuses the socket, sends the
/// rendered request, and makes sure a receive is posted. Skipped servers are
/// logged and the next one is tried.
async fn start_udp(
    ctx: &DriveCtx<'_>,
    lookup: &mut Lookup,
    slots: &mut Vec<UdpSlot>,
    inflight: &mut FuturesUnordered<BoxFuture<'static, RecvResult>>,
    from: usize,
) -> Option<usize> {
    let server_count = lookup.queries().len();
    let mut ix = from;
    while ix < server_count {
        let server = lookup.queries()[ix].server().clone();

        // later pass over the list: resend on the existing socket
        let mut resent = false;
        let mut recv_posted = false;
        if let Some(channel) = &slots[ix].channel {
            match channel.send(lookup.rendered(), &ctx.counters).await {
                Ok(()) => {
                    resent = true;
                    if !slots[ix].recv_outstanding {
                        inflight.push(recv_from_channel(ctx, channel, ix));
                        recv_posted = true;
                    }
                }
                Err(e) => warn!("Resend to {} failed: {}", server, e),
            }
        }
        if resent {
            if recv_posted {
                slots[ix].recv_outstanding = true;
            }
            lookup.queries_mut()[ix].mark_sent();
            return Some(ix);
        }
        slots[ix].channel = None;

        let addr = match server.dial_addr(ctx.opts.source).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Skipping server {}: {}", server, e);
                ix += 1;
                continue;
            }
        };
        if let Some(source) = ctx.opts.source {
            if !family_matches(addr.ip(), source) {
                warn!("Skipping server {}; incompatible address family", server);
                ix += 1;
                continue;
            }
        }
        let channel = match UdpChannel::open(addr, ctx.opts.source, &ctx.counters).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open UDP socket for {}: {}", server, e);
                ix += 1;
                continue;
            }
        };
        if let Err(e) = channel.send(lookup.rendered(), &ctx.counters).await {
            warn!("Send to {} failed: {}", server, e);
            ix += 1;
            continue;
        }
        lookup.queries_mut()[ix].set_sockaddr(addr);
        lookup.queries_mut()[ix].mark_sent();
        inflight.push(recv_from_channel(ctx, &channel, ix));
        slots[ix] = UdpSlot {
            channel: Some(channel),
            recv_outstanding: true,
        };
        return Some(ix);
    }
    None
}

fn recv_from_channel(
    ctx: &DriveCtx<'_>,
    channel: &UdpChannel,
    ix: usize,
) -> BoxFuture<'static, RecvResult> {
    let sock = channel.socket();
    let counters = ctx.counters.clone();
    let buf_size = ctx.opts.max_message_size;
    async move { (ix, transport::udp_recv(sock, buf_size, counters).await) }.boxed()
}

fn rearm_udp(
    ctx: &DriveCtx<'_>,
    slots: &mut [UdpSlot],
    ix: usize,
    inflight: &mut FuturesUnordered<BoxFuture<'static, RecvResult>>,
) {
    if let Some(channel) = &slots[ix].channel {
        inflight.push(recv_from_channel(ctx, channel, ix));
        slots[ix].recv_outstanding = true;
    }
}

fn report_received(ctx: &DriveCtx<'_>, lookup: &Lookup, ix: usize, payload: &[u8], from: SocketAddr) {
    let info = ReceivedInfo {
        from,
        bytes: payload.len(),
        rtt: lookup.queries()[ix].rtt(),
        when: Utc::now(),
    };
    ctx.hooks.on_received(payload, &info);
}

/// Surfaces an accepted message: advances the search list on a non-zero
/// rcode before anything is printed, otherwise hands the message to the
/// hooks and asks the follow-up generator whether a chase continues.
fn conclude(ctx: &DriveCtx<'_>, lookup: &Lookup, ix: usize, message: Message) -> Outcome {
    if message.response_code() != ResponseCode::NoError {
        let fctx = FollowupCtx {
            search: ctx.search,
            usesearch: ctx.opts.usesearch,
        };
        if let Some(next) = followup::next_origin(lookup, &fctx) {
            return Outcome::moved(vec![next]);
        }
    }
    ctx.hooks.on_message(&lookup.queries()[ix], &message);
    if let Some(chase) = followup::ns_chase(lookup, &message, ctx.opts.port) {
        return Outcome::moved(vec![chase]);
    }
    Outcome::of(Disposition::Answered)
}

enum ExchangeEnd {
    Outcome(Outcome),
    /// Server skipped before any socket was opened.
    Unusable,
    /// Connect, send, or read failed or timed out.
    Unreached,
    /// SERVFAIL with rotation allowed.
    ServFail(usize, Box<Message>),
}

async fn drive_tcp(ctx: &DriveCtx<'_>, lookup: &mut Lookup) -> Outcome {
    let server_count = lookup.queries().len();
    let mut cursor = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            return Outcome::of(Disposition::Canceled);
        }
        let has_successor = cursor + 1 < server_count;
        let end = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Outcome::of(Disposition::Canceled),
            end = tcp_exchange(ctx, lookup, cursor) => end,
        };
        match end {
            ExchangeEnd::Outcome(outcome) => return outcome,
            ExchangeEnd::Unusable | ExchangeEnd::Unreached if has_successor => {
                debug!("Trying next server");
                cursor += 1;
            }
            ExchangeEnd::Unusable => return Outcome::of(Disposition::NoServers),
            ExchangeEnd::Unreached => {
                if lookup.retries() > 1 {
                    debug!("Making new TCP request, {} tries left", lookup.retries() - 1);
                    return Outcome::moved(vec![followup::tcp_requeue(lookup)]);
                }
                return Outcome::of(Disposition::NoServers);
            }
            ExchangeEnd::ServFail(ix, message) => {
                warn!("Got SERVFAIL reply from {}, trying next server", lookup.queries()[ix].server());
                if has_successor {
                    cursor += 1;
                } else {
                    return conclude(ctx, lookup, ix, *message);
                }
            }
        }
    }
}

/// One TCP dialog with one server: connect, send the length-framed request,
/// then read framed messages until the response, or the transfer stream, is
/// complete. The timeout applies per step so a stalled transfer is detected
/// without bounding its total duration.
async fn tcp_exchange(ctx: &DriveCtx<'_>, lookup: &mut Lookup, ix: usize) -> ExchangeEnd {
    let has_successor = ix + 1 < lookup.queries().len();
    let wait = query_timeout(true, lookup.doing_xfr(), lookup.spec().timeout, has_successor);
    let server = lookup.queries()[ix].server().clone();

    let addr = match server.dial_addr(ctx.opts.source).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Skipping server {}: {}", server, e);
            return ExchangeEnd::Unusable;
        }
    };
    if let Some(source) = ctx.opts.source {
        if !family_matches(addr.ip(), source) {
            warn!("Skipping server {}; incompatible address family", server);
            return ExchangeEnd::Unusable;
        }
    }

    let mut channel = match timeout(wait, TcpChannel::connect(addr, ctx.opts.source, &ctx.counters)).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            warn!("Connection to {} failed: {}", server, e);
            return ExchangeEnd::Unreached;
        }
        Err(_) => {
            debug!("Connection to {} timed out", server);
            return ExchangeEnd::Unreached;
        }
    };
    lookup.queries_mut()[ix].set_sockaddr(addr);

    match timeout(wait, channel.send_message(lookup.rendered(), &ctx.counters)).await {
        Ok(Ok(())) => lookup.queries_mut()[ix].mark_sent(),
        Ok(Err(e)) => {
            warn!("Send to {} failed: {}", server, e);
            return ExchangeEnd::Unreached;
        }
        Err(_) => {
            debug!("Send to {} timed out", server);
            return ExchangeEnd::Unreached;
        }
    }

    if let Some(mode) = lookup.xfr_mode() {
        lookup.queries_mut()[ix].start_xfr(XfrTracker::new(mode, ctx.opts.rr_limit));
    }

    loop {
        let payload = match timeout(wait, channel.recv_message(ctx.opts.max_message_size, &ctx.counters)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(RecvError::Oversized { length, limit })) => {
                return ExchangeEnd::Outcome(Outcome::of(Disposition::Fatal {
                    reason: format!("message length {} exceeds the receive buffer of {} octets", length, limit),
                }));
            }
            Ok(Err(RecvError::Io(e))) => {
                warn!("Read from {} failed: {}", server, e);
                return ExchangeEnd::Unreached;
            }
            Err(_) => {
                debug!("Read from {} timed out", server);
                return ExchangeEnd::Unreached;
            }
        };

        match apply_gates(lookup, &payload) {
            Gate::Discard(reason) => {
                debug!("Discarding message from {}: {}", server, reason);
            }
            Gate::TcpRetry => {
                // cannot happen, the truncation gate skips TCP lookups
                debug!("Ignoring truncation bit on TCP response from {}", server);
            }
            Gate::BestEffort => {
                report_received(ctx, lookup, ix, &payload, channel.peer());
                return ExchangeEnd::Outcome(Outcome::of(Disposition::Answered));
            }
            Gate::ParseFailed(_) => {
                return ExchangeEnd::Outcome(Outcome::of(Disposition::ParseFailed));
            }
            Gate::NextServer(message) => {
                report_received(ctx, lookup, ix, &payload, channel.peer());
                return ExchangeEnd::ServFail(ix, message);
            }
            Gate::Accept(message) => {
                report_received(ctx, lookup, ix, &payload, channel.peer());
                if lookup.queries()[ix].xfr().is_none() {
                    return ExchangeEnd::Outcome(conclude(ctx, lookup, ix, *message));
                }
                let progress = lookup.queries_mut()[ix]
                    .xfr_mut()
                    .map(|tracker| tracker.observe_message(&message))
                    .unwrap_or(Progress::Continue);
                ctx.hooks.on_message(&lookup.queries()[ix], &message);
                match progress {
                    Progress::Continue => {}
                    Progress::Done(completion) => {
                        debug!("Transfer complete: {:?}", completion);
                        return ExchangeEnd::Outcome(Outcome::of(Disposition::Answered));
                    }
                    Progress::LimitReached => {
                        let count = lookup.queries()[ix].xfr().map(XfrTracker::rr_count).unwrap_or_default();
                        warn!("Transfer record limit reached after {} records", count);
                        return ExchangeEnd::Outcome(Outcome::of(Disposition::RecordLimit { count }));
                    }
                    Progress::Failed(reason) => {
                        return ExchangeEnd::Outcome(Outcome::of(Disposition::TransferFailed {
                            reason: reason.to_string(),
                        }));
                    }
                }
            }
        }
    }
}
