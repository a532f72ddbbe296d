//! Response gates.
//!
//! Every inbound datagram or framed TCP message passes the same gate chain
//! in order: cancellation, parse, truncation, SERVFAIL, TSIG. The transport
//! drivers act on the verdict; gates never do I/O themselves.

use hickory_proto::op::{Message, ResponseCode};
use tracing::{debug, warn};

use crate::engine::lookup::Lookup;
use crate::utils::hexdump::hexdump;

#[derive(Debug)]
pub(crate) enum Gate {
    /// Silently ignore this payload and keep waiting.
    Discard(&'static str),
    /// Unparsable but tolerated; the raw bytes are still reported upward.
    BestEffort,
    /// Unparsable, lookup is to be canceled.
    ParseFailed(String),
    /// Truncated UDP response, re-queue the lookup over TCP.
    TcpRetry,
    /// SERVFAIL and rotation is allowed; surface the message only if no
    /// server is left to rotate to.
    NextServer(Box<Message>),
    /// Passed all gates.
    Accept(Box<Message>),
}

pub(crate) fn apply_gates(lookup: &mut Lookup, payload: &[u8]) -> Gate {
    if !lookup.pending() {
        return Gate::Discard("lookup is no longer pending");
    }

    let message = match Message::from_vec(payload) {
        Ok(message) => message,
        Err(e) if lookup.spec().best_effort => {
            warn!("Tolerating malformed response: {}", e);
            return Gate::BestEffort;
        }
        Err(e) => {
            warn!("Malformed response: {}", e);
            debug!("Offending message:\n{}", hexdump(payload));
            return Gate::ParseFailed(e.to_string());
        }
    };

    if message.id() != lookup.id() {
        return Gate::Discard("response id does not match query id");
    }

    if message.truncated() && !lookup.spec().ignore_tc && !lookup.tcp_mode() {
        debug!("Response truncated, retrying over TCP");
        return Gate::TcpRetry;
    }

    if message.response_code() == ResponseCode::ServFail && !lookup.spec().servfail_stops {
        return Gate::NextServer(Box::new(message));
    }

    let first = lookup.msg_counter() == 0;
    if let Some(tsig) = lookup.tsig_mut() {
        // a failed verification marks the lookup invalid but never aborts it
        tsig.verify(payload, first);
    }
    lookup.bump_msg_counter();

    Gate::Accept(Box::new(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    use crate::engine::lookup::{LookupSpec, SearchList, SetupCtx};
    use crate::nameserver::ServerSpec;

    fn setup(spec: LookupSpec) -> Lookup {
        let servers = vec![ServerSpec::new([192, 0, 2, 1], 53), ServerSpec::new([192, 0, 2, 2], 53)];
        let search = SearchList::default();
        let ctx = SetupCtx {
            default_servers: &servers,
            search: &search,
            usesearch: false,
            domain_override: None,
        };
        Lookup::setup(spec, &ctx).expect("setup failed")
    }

    fn response_for(lookup: &Lookup) -> Message {
        let mut message = Message::new();
        message
            .set_id(lookup.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        message.add_query(hickory_proto::op::Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        message
    }

    #[test]
    fn matching_response_is_accepted() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A));
        let payload = response_for(&lookup).to_vec().unwrap();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::Accept(_))).is_true();
        assert_that(&lookup.msg_counter()).is_equal_to(1);
    }

    #[test]
    fn cancelled_lookup_discards() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A));
        let payload = response_for(&lookup).to_vec().unwrap();
        lookup.clear();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::Discard(_))).is_true();
    }

    #[test]
    fn mismatched_id_discards() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A));
        let mut response = response_for(&lookup);
        response.set_id(lookup.id().wrapping_add(1));
        let payload = response.to_vec().unwrap();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::Discard(_))).is_true();
        assert_that(&lookup.msg_counter()).is_equal_to(0);
    }

    #[test]
    fn truncation_triggers_tcp_retry() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A));
        let mut response = response_for(&lookup);
        response.set_truncated(true);
        let payload = response.to_vec().unwrap();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::TcpRetry)).is_true();
    }

    #[test]
    fn truncation_ignored_when_requested() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A).set_ignore_tc(true));
        let mut response = response_for(&lookup);
        response.set_truncated(true);
        let payload = response.to_vec().unwrap();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::Accept(_))).is_true();
    }

    #[test]
    fn truncation_on_tcp_is_surfaced() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A).set_tcp_mode(true));
        let mut response = response_for(&lookup);
        response.set_truncated(true);
        let payload = response.to_vec().unwrap();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::Accept(_))).is_true();
    }

    #[test]
    fn servfail_rotates_by_default() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A).set_servfail_stops(false));
        let mut response = response_for(&lookup);
        response.set_response_code(ResponseCode::ServFail);
        let payload = response.to_vec().unwrap();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::NextServer(_))).is_true();
    }

    #[test]
    fn servfail_surfaces_when_it_stops() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A).set_servfail_stops(true));
        let mut response = response_for(&lookup);
        response.set_response_code(ResponseCode::ServFail);
        let payload = response.to_vec().unwrap();

        let gate = apply_gates(&mut lookup, &payload);

        assert_that(&matches!(gate, Gate::Accept(_))).is_true();
    }

    #[test]
    fn garbage_fails_parse_gate() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A));

        let gate = apply_gates(&mut lookup, &[0x00, 0x01, 0x02]);

        assert_that(&matches!(gate, Gate::ParseFailed(_))).is_true();
    }

    #[test]
    fn garbage_tolerated_with_best_effort() {
        crate::utils::tests::logging::init();
        let mut lookup = setup(LookupSpec::new("example.com.", RecordType::A).set_best_effort(true));

        let gate = apply_gates(&mut lookup, &[0x00, 0x01, 0x02]);

        assert_that(&matches!(gate, Gate::BestEffort)).is_true();
    }
}
