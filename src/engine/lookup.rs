//! User-level questions and their materialization into wire messages.
//!
//! A [`LookupSpec`] is the queued form of a question, carrying the name as
//! typed and all policy. When the scheduler pops it, [`Lookup::setup`] turns
//! it into a [`Lookup`]: origin resolved against the search list, message
//! built and rendered once, one [`Query`] allocated per server. The rendered
//! bytes are reused for every server in the list.

use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query as WireQuery};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tracing::debug;

use crate::engine::query::Query;
use crate::engine::tsig::{TsigKey, TsigSession};
use crate::engine::xfr::XfrMode;
use crate::engine::Error;
use crate::nameserver::ServerSpec;

/// EDNS0 payload advertised when DNSSEC is requested without an explicit
/// buffer size.
pub const DEFAULT_EDNS_PAYLOAD: u16 = 2048;

/// The search list from the system configuration: ordered origins plus the
/// `ndots` threshold deciding when a name is tried absolute first.
#[derive(Debug, Clone, Default)]
pub struct SearchList {
    entries: Vec<Name>,
    ndots: usize,
}

impl SearchList {
    pub fn new<T: Into<Vec<Name>>>(entries: T, ndots: usize) -> SearchList {
        SearchList {
            entries: entries.into(),
            ndots,
        }
    }

    pub fn entries(&self) -> &[Name] {
        &self.entries
    }

    pub fn ndots(&self) -> usize {
        self.ndots
    }
}

#[doc(hidden)]
impl From<resolv_conf::Config> for SearchList {
    fn from(config: resolv_conf::Config) -> Self {
        // `domain` and `search` are mutually exclusive in resolv.conf
        // parsing, the later directive wins, which also makes a configured
        // domain the first and only entry.
        let raw: Vec<String> = match (config.get_domain(), config.get_search()) {
            (Some(domain), _) => vec![domain.clone()],
            (None, Some(search)) => search.clone(),
            (None, None) => Vec::new(),
        };
        let entries = raw
            .iter()
            .filter_map(|entry| {
                Name::from_ascii(entry)
                    .and_then(|name| name.append_domain(&Name::root()))
                    .ok()
            })
            .collect();
        SearchList {
            entries,
            ndots: config.ndots as usize,
        }
    }
}

/// Where the query name's origin comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Origin {
    /// Absolute lookup, no origin appended.
    #[default]
    None,
    /// Index into the search list.
    Search(usize),
    /// A fixed origin, e.g. a domain override from the command line.
    Fixed(Name),
}

/// One user-level question with all its policy, in queueable form.
#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub(crate) textname: String,
    pub(crate) rdtype: RecordType,
    pub(crate) rdclass: DNSClass,
    pub(crate) servers: Vec<ServerSpec>,
    pub(crate) origin: Origin,
    pub(crate) recurse: bool,
    pub(crate) aa_only: bool,
    pub(crate) ad: bool,
    pub(crate) cd: bool,
    pub(crate) dnssec: bool,
    pub(crate) tcp_mode: bool,
    pub(crate) ignore_tc: bool,
    pub(crate) trace: bool,
    pub(crate) trace_root: bool,
    pub(crate) ns_search_only: bool,
    pub(crate) servfail_stops: bool,
    pub(crate) best_effort: bool,
    pub(crate) identify: bool,
    pub(crate) defname: bool,
    pub(crate) new_search: bool,
    pub(crate) retries: usize,
    pub(crate) udpsize: u16,
    pub(crate) ixfr_serial: u32,
    pub(crate) timeout: Option<Duration>,
    pub(crate) tsig: Option<TsigKey>,
}

impl LookupSpec {
    pub fn new<N: Into<String>>(textname: N, rdtype: RecordType) -> LookupSpec {
        LookupSpec {
            textname: textname.into(),
            rdtype,
            rdclass: DNSClass::IN,
            servers: Vec::new(),
            origin: Origin::None,
            recurse: true,
            aa_only: false,
            ad: false,
            cd: false,
            dnssec: false,
            tcp_mode: false,
            ignore_tc: false,
            trace: false,
            trace_root: false,
            ns_search_only: false,
            servfail_stops: true,
            best_effort: false,
            identify: false,
            defname: false,
            new_search: true,
            retries: 3,
            udpsize: 0,
            ixfr_serial: 0,
            timeout: None,
            tsig: None,
        }
    }

    /// A full zone transfer; forces TCP.
    pub fn axfr<N: Into<String>>(textname: N) -> LookupSpec {
        LookupSpec::new(textname, RecordType::AXFR)
    }

    /// An incremental zone transfer from `serial`; forces TCP.
    pub fn ixfr<N: Into<String>>(textname: N, serial: u32) -> LookupSpec {
        let mut spec = LookupSpec::new(textname, RecordType::IXFR);
        spec.ixfr_serial = serial;
        spec
    }

    /// A reverse lookup for an address, in nibble form for IPv6.
    pub fn reverse<T: Into<IpAddr>>(addr: T) -> LookupSpec {
        let name = match addr.into() {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                format!(
                    "{}.{}.{}.{}.in-addr.arpa.",
                    octets[3], octets[2], octets[1], octets[0]
                )
            }
            IpAddr::V6(v6) => {
                let mut name = String::with_capacity(74);
                for octet in v6.octets().iter().rev() {
                    name.push_str(&format!("{:x}.{:x}.", octet & 0xf, octet >> 4));
                }
                name.push_str("ip6.arpa.");
                name
            }
        };
        LookupSpec::new(name, RecordType::PTR)
    }

    pub fn textname(&self) -> &str {
        &self.textname
    }

    pub fn rdtype(&self) -> RecordType {
        self.rdtype
    }

    pub fn set_rdclass(mut self, rdclass: DNSClass) -> Self {
        self.rdclass = rdclass;
        self
    }

    pub fn set_servers<T: Into<Vec<ServerSpec>>>(mut self, servers: T) -> Self {
        self.servers = servers.into();
        self
    }

    pub fn set_recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }

    pub fn set_aa_only(mut self, aa_only: bool) -> Self {
        self.aa_only = aa_only;
        self
    }

    pub fn set_ad(mut self, ad: bool) -> Self {
        self.ad = ad;
        self
    }

    pub fn set_cd(mut self, cd: bool) -> Self {
        self.cd = cd;
        self
    }

    pub fn set_dnssec(mut self, dnssec: bool) -> Self {
        self.dnssec = dnssec;
        self
    }

    pub fn set_tcp_mode(mut self, tcp_mode: bool) -> Self {
        self.tcp_mode = tcp_mode;
        self
    }

    pub fn set_ignore_tc(mut self, ignore_tc: bool) -> Self {
        self.ignore_tc = ignore_tc;
        self
    }

    /// Walk the delegation chain from the root instead of asking one
    /// recursive server.
    pub fn set_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self.trace_root = trace;
        self
    }

    pub fn set_ns_search_only(mut self, ns_search_only: bool) -> Self {
        self.ns_search_only = ns_search_only;
        self
    }

    /// Whether a SERVFAIL response ends the lookup instead of rotating to the
    /// next server.
    pub fn set_servfail_stops(mut self, servfail_stops: bool) -> Self {
        self.servfail_stops = servfail_stops;
        self
    }

    pub fn set_best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn set_identify(mut self, identify: bool) -> Self {
        self.identify = identify;
        self
    }

    pub fn set_defname(mut self, defname: bool) -> Self {
        self.defname = defname;
        self
    }

    pub fn set_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn set_udpsize(mut self, udpsize: u16) -> Self {
        self.udpsize = udpsize;
        self
    }

    /// A zero duration means "use the per-transport default".
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn set_tsig(mut self, key: TsigKey) -> Self {
        self.tsig = Some(key);
        self
    }
}

/// Everything from the engine configuration that lookup setup needs.
#[derive(Debug)]
pub(crate) struct SetupCtx<'a> {
    pub default_servers: &'a [ServerSpec],
    pub search: &'a SearchList,
    pub usesearch: bool,
    pub domain_override: Option<&'a Name>,
}

/// A materialized lookup: rendered message, server list, query table.
#[derive(Debug)]
pub struct Lookup {
    spec: LookupSpec,
    origin: Origin,
    qname: Name,
    qtype: RecordType,
    id: u16,
    message: Message,
    rendered: Vec<u8>,
    queries: Vec<Query>,
    tsig: Option<TsigSession>,
    retries: usize,
    pending: bool,
    msg_counter: usize,
    doing_xfr: bool,
    tcp_mode: bool,
}

impl Lookup {
    /// Builds the outbound message and one query per server.
    pub(crate) fn setup(spec: LookupSpec, ctx: &SetupCtx<'_>) -> Result<Lookup, Error> {
        let mut spec = spec;
        if spec.servers.is_empty() {
            spec.servers = ctx.default_servers.to_vec();
        }

        let mut origin = spec.origin.clone();
        let dots = spec.textname.matches('.').count();
        let absolute = dots >= ctx.search.ndots() || spec.defname;
        if !absolute
            && origin == Origin::None
            && spec.new_search
            && (ctx.usesearch || ctx.domain_override.is_some())
        {
            origin = match ctx.domain_override {
                Some(domain) => Origin::Fixed(domain.clone()),
                None if !ctx.search.entries().is_empty() => Origin::Search(0),
                None => Origin::None,
            };
        }

        let (qname, qtype) = if spec.trace && spec.trace_root {
            // the first step of a trace asks the configured resolver for the
            // root zone's SOA
            (Name::root(), RecordType::SOA)
        } else {
            let base = Name::from_ascii(&spec.textname).map_err(|e| Error::InvalidName {
                name: spec.textname.clone(),
                reason: e.to_string(),
            })?;
            let qname = if base.is_fqdn() {
                base
            } else {
                let origin_name = match &origin {
                    Origin::None => Name::root(),
                    Origin::Search(i) => ctx.search.entries()[*i].clone(),
                    Origin::Fixed(name) => name.clone(),
                };
                base.append_domain(&origin_name).map_err(|e| Error::InvalidName {
                    name: spec.textname.clone(),
                    reason: e.to_string(),
                })?
            };
            (qname, spec.rdtype)
        };
        debug!("Looking up {} {:?}", qname, qtype);

        let id: u16 = rand::random();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(spec.recurse && !spec.trace && !spec.ns_search_only)
            .set_authoritative(spec.aa_only)
            .set_authentic_data(spec.ad)
            .set_checking_disabled(spec.cd);
        let mut question = WireQuery::query(qname.clone(), qtype);
        question.set_query_class(spec.rdclass);
        message.add_query(question);

        let doing_xfr = matches!(qtype, RecordType::AXFR | RecordType::IXFR);
        let tcp_mode = spec.tcp_mode || doing_xfr;
        if qtype == RecordType::IXFR {
            // minimal SOA in the authority section carrying the client serial
            let soa = SOA::new(Name::root(), Name::root(), spec.ixfr_serial, 0, 0, 0, 0);
            message.add_name_server(Record::from_rdata(qname.clone(), 0, RData::SOA(soa)));
        }

        if spec.udpsize > 0 || spec.dnssec {
            let mut edns = Edns::new();
            edns.set_max_payload(if spec.udpsize > 0 {
                spec.udpsize
            } else {
                DEFAULT_EDNS_PAYLOAD
            });
            edns.set_version(0);
            edns.flags_mut().dnssec_ok = spec.dnssec;
            message.extensions_mut().replace(edns);
        }

        let mut tsig = match &spec.tsig {
            Some(key) => Some(TsigSession::new(key)?),
            None => None,
        };
        if let Some(session) = tsig.as_mut() {
            session.sign(&mut message)?;
        }
        let rendered = message.to_vec()?;

        let queries: Vec<Query> = spec.servers.iter().cloned().map(Query::new).collect();
        let retries = spec.retries;

        Ok(Lookup {
            spec,
            origin,
            qname,
            qtype,
            id,
            message,
            rendered,
            queries,
            tsig,
            retries,
            pending: true,
            msg_counter: 0,
            doing_xfr,
            tcp_mode,
        })
    }

    pub fn spec(&self) -> &LookupSpec {
        &self.spec
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn qname(&self) -> &Name {
        &self.qname
    }

    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The rendered request, reused for every server in the list.
    pub fn rendered(&self) -> &[u8] {
        &self.rendered
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    pub(crate) fn queries_mut(&mut self) -> &mut [Query] {
        &mut self.queries
    }

    pub fn tcp_mode(&self) -> bool {
        self.tcp_mode
    }

    pub fn doing_xfr(&self) -> bool {
        self.doing_xfr
    }

    pub(crate) fn xfr_mode(&self) -> Option<XfrMode> {
        match self.qtype {
            RecordType::AXFR => Some(XfrMode::Axfr),
            RecordType::IXFR => Some(XfrMode::Ixfr {
                client_serial: self.spec.ixfr_serial,
            }),
            _ => None,
        }
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub(crate) fn dec_retries(&mut self) {
        self.retries = self.retries.saturating_sub(1);
    }

    /// Messages already parsed for this lookup, for TSIG continuation.
    pub fn msg_counter(&self) -> usize {
        self.msg_counter
    }

    pub(crate) fn bump_msg_counter(&mut self) {
        self.msg_counter += 1;
    }

    pub(crate) fn tsig_mut(&mut self) -> Option<&mut TsigSession> {
        self.tsig.as_mut()
    }

    /// False once any response of this lookup failed TSIG verification.
    pub fn tsig_valid(&self) -> bool {
        self.tsig.as_ref().map(TsigSession::valid).unwrap_or(true)
    }

    /// Releases every query and marks the lookup terminal. Idempotent.
    pub(crate) fn clear(&mut self) {
        for query in &mut self.queries {
            query.clear();
        }
        self.pending = false;
        self.retries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    use hickory_proto::op::ResponseCode;
    use std::str::FromStr;

    fn ctx<'a>(servers: &'a [ServerSpec], search: &'a SearchList) -> SetupCtx<'a> {
        SetupCtx {
            default_servers: servers,
            search,
            usesearch: true,
            domain_override: None,
        }
    }

    fn defaults() -> (Vec<ServerSpec>, SearchList) {
        let servers = vec![ServerSpec::new([192, 0, 2, 1], 53)];
        let search = SearchList::new(
            vec![Name::from_str("corp.example.").unwrap(), Name::from_str("example.com.").unwrap()],
            1,
        );
        (servers, search)
    }

    #[test]
    fn rendered_message_roundtrips() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let spec = LookupSpec::new("www.example.com", RecordType::A);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");
        let parsed = Message::from_vec(lookup.rendered()).expect("rendered message did not parse");

        assert_that(&parsed.id()).is_equal_to(lookup.id());
        assert_that(&parsed.op_code()).is_equal_to(OpCode::Query);
        assert_that(&parsed.recursion_desired()).is_true();
        assert_that(&parsed.response_code()).is_equal_to(ResponseCode::NoError);
        let question = parsed.queries().first().expect("question missing").clone();
        assert_that(&question.name().to_ascii()).is_equal_to("www.example.com.".to_string());
        assert_that(&question.query_type()).is_equal_to(RecordType::A);
        assert_that(&question.query_class()).is_equal_to(DNSClass::IN);
    }

    #[test]
    fn name_below_ndots_gets_first_search_origin() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let spec = LookupSpec::new("www", RecordType::A);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.origin()).is_equal_to(&Origin::Search(0));
        assert_that(&lookup.qname().to_ascii()).is_equal_to("www.corp.example.".to_string());
    }

    #[test]
    fn name_with_exactly_ndots_dots_is_absolute() {
        crate::utils::tests::logging::init();
        let (servers, mut search) = defaults();
        search.ndots = 2;
        let spec = LookupSpec::new("www.internal.example", RecordType::A);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.origin()).is_equal_to(&Origin::None);
        assert_that(&lookup.qname().to_ascii()).is_equal_to("www.internal.example.".to_string());
    }

    #[test]
    fn name_below_ndots_is_searched() {
        crate::utils::tests::logging::init();
        let (servers, mut search) = defaults();
        search.ndots = 2;
        let spec = LookupSpec::new("www.internal", RecordType::A);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.origin()).is_equal_to(&Origin::Search(0));
        assert_that(&lookup.qname().to_ascii()).is_equal_to("www.internal.corp.example.".to_string());
    }

    #[test]
    fn trailing_dot_is_always_absolute() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let spec = LookupSpec::new("www.", RecordType::A);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.qname().to_ascii()).is_equal_to("www.".to_string());
    }

    #[test]
    fn domain_override_becomes_fixed_origin() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let domain = Name::from_str("lab.example.").unwrap();
        let ctx = SetupCtx {
            default_servers: &servers,
            search: &search,
            usesearch: false,
            domain_override: Some(&domain),
        };
        let spec = LookupSpec::new("db", RecordType::A);

        let lookup = Lookup::setup(spec, &ctx).expect("setup failed");

        assert_that(&lookup.origin()).is_equal_to(&Origin::Fixed(domain.clone()));
        assert_that(&lookup.qname().to_ascii()).is_equal_to("db.lab.example.".to_string());
    }

    #[test]
    fn trace_root_rewrites_to_root_soa() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let spec = LookupSpec::new("www.example.com", RecordType::A).set_trace(true);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.qname().is_root()).is_true();
        assert_that(&lookup.qtype()).is_equal_to(RecordType::SOA);
        assert_that(&lookup.message().recursion_desired()).is_false();
        assert_that(&lookup.tcp_mode()).is_false();
    }

    #[test]
    fn ixfr_forces_tcp_and_carries_serial_in_authority() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let spec = LookupSpec::ixfr("example.com.", 42);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.tcp_mode()).is_true();
        assert_that(&lookup.doing_xfr()).is_true();
        let soa_serial = lookup
            .message()
            .name_servers()
            .iter()
            .find_map(|rr| match rr.data() {
                RData::SOA(soa) => Some(soa.serial()),
                _ => None,
            });
        assert_that(&soa_serial).is_equal_to(Some(42));
        assert_that(&lookup.xfr_mode()).is_equal_to(Some(XfrMode::Ixfr { client_serial: 42 }));
    }

    #[test]
    fn dnssec_attaches_edns_with_do_bit() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let spec = LookupSpec::new("example.com.", RecordType::A).set_dnssec(true);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        let edns = lookup.message().extensions().as_ref().expect("OPT record missing");
        assert_that(&edns.max_payload()).is_equal_to(DEFAULT_EDNS_PAYLOAD);
        assert_that(&edns.flags().dnssec_ok).is_true();
    }

    #[test]
    fn invalid_name_is_a_usage_error() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let too_long = "a".repeat(64);
        let spec = LookupSpec::new(too_long.as_str(), RecordType::A);

        let result = Lookup::setup(spec, &ctx(&servers, &search));

        assert_that(&matches!(result, Err(Error::InvalidName { .. }))).is_true();
    }

    #[test]
    fn one_query_per_server() {
        crate::utils::tests::logging::init();
        let servers = vec![
            ServerSpec::new([192, 0, 2, 1], 53),
            ServerSpec::new([192, 0, 2, 2], 53),
            ServerSpec::new([192, 0, 2, 3], 53),
        ];
        let search = SearchList::default();
        let spec = LookupSpec::new("example.com.", RecordType::A);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.queries().len()).is_equal_to(3);
        assert_that(&lookup.pending()).is_true();
    }

    #[test]
    fn tsig_key_appends_signature_record() {
        crate::utils::tests::logging::init();
        let (servers, search) = defaults();
        let key = crate::engine::tsig::TsigKey::new(
            Name::from_str("transfer-key.").unwrap(),
            hickory_proto::dnssec::rdata::tsig::TsigAlgorithm::HmacSha256,
            b"0123456789abcdef0123456789abcdef".to_vec(),
        );
        let spec = LookupSpec::axfr("example.com.").set_tsig(key);

        let lookup = Lookup::setup(spec, &ctx(&servers, &search)).expect("setup failed");

        assert_that(&lookup.tsig_valid()).is_true();
        let has_tsig = lookup
            .message()
            .signature()
            .iter()
            .any(|rr| rr.record_type() == RecordType::TSIG);
        assert_that(&has_tsig).is_true();
    }

    #[test]
    fn reverse_v4_name() {
        let spec = LookupSpec::reverse([192, 0, 2, 99]);
        assert_that(&spec.textname()).is_equal_to("99.2.0.192.in-addr.arpa.");
        assert_that(&spec.rdtype()).is_equal_to(RecordType::PTR);
    }

    #[test]
    fn reverse_v6_name_is_nibble_format() {
        let addr: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        let spec = LookupSpec::reverse(addr);
        assert_that(&spec.textname())
            .is_equal_to("1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa.");
    }
}
