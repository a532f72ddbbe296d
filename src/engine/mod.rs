//! The asynchronous query engine.
//!
//! An [`Engine`] owns everything the lookup machinery shares: the lookup
//! queue, the live-resource counters, the cancel flag, and the exit-code
//! ratchet. Lookups are processed strictly sequentially; a response may
//! prepend follow-up lookups (trace steps, search-list advances, TC→TCP
//! retries) which run before anything else in the queue.
//!
//! ```no_run
//! # use mdig::engine::{Engine, EngineOpts, LookupSpec};
//! # use mdig::RecordType;
//! # #[tokio::main]
//! # async fn main() -> mdig::Result<()> {
//! let mut engine = Engine::from_system_config(EngineOpts::default())?;
//! engine.seed(LookupSpec::new("www.example.com", RecordType::A));
//! let exit_code = engine.run().await;
//! # let _ = exit_code;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hickory_proto::rr::Name;
use tokio::sync::Notify;
use tracing::{debug, error, info_span, warn};
use tracing_futures::Instrument;

mod drive;
pub mod error;
mod followup;
pub mod hooks;
pub mod lookup;
pub mod query;
mod response;
pub mod transport;
pub mod tsig;
pub mod xfr;

pub use error::Error;
pub use hooks::{EngineHooks, NoopHooks, ReceivedInfo};
pub use lookup::{Lookup, LookupSpec, Origin, SearchList, DEFAULT_EDNS_PAYLOAD};
pub use query::Query;
pub use transport::{CounterSnapshot, SERVER_TIMEOUT, TCP_TIMEOUT, UDP_TIMEOUT};
pub use tsig::TsigKey;
pub use xfr::{Completion, XfrMode, XfrTracker};

use crate::error::exit_code;
use crate::nameserver::{ServerGroup, ServerSpec};
use crate::Result;
use drive::Disposition;
use lookup::SetupCtx;
use transport::Counters;

/// Hard bound on chained lookups; exceeding it is treated as a loop and is
/// fatal.
pub const LOOKUP_LIMIT: usize = 64;

/// At most this many name servers are chased from the initial root probe of
/// a trace.
pub const MXSERV: usize = 20;

/// Engine-wide policy. Per-lookup policy lives on [`LookupSpec`].
#[derive(Debug, Clone)]
pub struct EngineOpts {
    /// Port chased and default servers are dialed on.
    pub port: u16,
    /// Apply the search list to relative names.
    pub usesearch: bool,
    /// Fixed origin overriding the search list, e.g. from `+domain=`.
    pub domain_override: Option<Name>,
    /// Abort zone transfers after this many records.
    pub rr_limit: Option<usize>,
    /// Receive buffer ceiling; a TCP length prefix beyond this is fatal.
    pub max_message_size: usize,
    /// Source address to bind; servers of the other family are skipped.
    pub source: Option<IpAddr>,
}

impl Default for EngineOpts {
    fn default() -> Self {
        EngineOpts {
            port: crate::nameserver::DEFAULT_DNS_PORT,
            usesearch: true,
            domain_override: None,
            rr_limit: None,
            max_message_size: u16::MAX as usize,
            source: None,
        }
    }
}

/// Cloneable handle to stop the engine, e.g. from a signal handler task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<CancelInner>);

#[derive(Debug, Default)]
struct CancelInner {
    cancel_now: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Cancels the current lookup and drains the queue. Idempotent.
    pub fn cancel_all(&self) {
        self.0.cancel_now.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancel_now.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared references the transport drivers need.
pub(crate) struct DriveCtx<'a> {
    pub opts: &'a EngineOpts,
    pub search: &'a SearchList,
    pub counters: Arc<Counters>,
    pub hooks: &'a dyn EngineHooks,
    pub cancel: &'a CancelHandle,
}

/// The serial lookup scheduler and its shared state.
pub struct Engine {
    opts: EngineOpts,
    servers: Vec<ServerSpec>,
    search: SearchList,
    queue: VecDeque<LookupSpec>,
    counters: Arc<Counters>,
    hooks: Arc<dyn EngineHooks>,
    cancel: CancelHandle,
    exit_code: u8,
    lookup_counter: usize,
}

impl Engine {
    pub fn new(servers: Vec<ServerSpec>, search: SearchList, opts: EngineOpts) -> Engine {
        Engine {
            opts,
            servers,
            search,
            queue: VecDeque::new(),
            counters: Arc::new(Counters::default()),
            hooks: Arc::new(NoopHooks),
            cancel: CancelHandle::default(),
            exit_code: exit_code::OK,
            lookup_counter: 0,
        }
    }

    /// Builds an engine from `/etc/resolv.conf`: server list, search list,
    /// and ndots.
    pub fn from_system_config(opts: EngineOpts) -> Result<Engine> {
        let servers = ServerGroup::from_system_config()?.into_servers();
        let search: SearchList = crate::system_config::load_from_system_config()?;
        Ok(Engine::new(servers, search, opts))
    }

    pub fn with_hooks<H: EngineHooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Appends a user lookup to the queue.
    pub fn seed(&mut self, spec: LookupSpec) {
        self.queue.push_back(spec);
    }

    /// Handle for stopping the engine from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// The ratcheted exit code so far.
    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }

    fn ratchet_exit(&mut self, code: u8) {
        if code > self.exit_code {
            self.exit_code = code;
        }
    }

    /// Runs the queue to completion and returns the exit code. Lookups are
    /// driven one at a time; follow-ups spawned by a response run first.
    pub async fn run(&mut self) -> u8 {
        while let Some(spec) = self.queue.pop_front() {
            if self.cancel.is_cancelled() {
                debug!("Cancelled, draining {} queued lookups", self.queue.len() + 1);
                break;
            }

            if spec.new_search {
                self.lookup_counter = 0;
            }
            self.lookup_counter += 1;
            if self.lookup_counter > LOOKUP_LIMIT {
                error!("{}", Error::LookupLimit { limit: LOOKUP_LIMIT });
                self.ratchet_exit(exit_code::INTERNAL);
                break;
            }

            let ctx = SetupCtx {
                default_servers: &self.servers,
                search: &self.search,
                usesearch: self.opts.usesearch,
                domain_override: self.opts.domain_override.as_ref(),
            };
            let mut lookup = match Lookup::setup(spec, &ctx) {
                Ok(lookup) => lookup,
                Err(e @ Error::InvalidName { .. }) => {
                    error!("{}", e);
                    self.ratchet_exit(exit_code::USAGE);
                    break;
                }
                Err(e) => {
                    error!("{}", e);
                    self.ratchet_exit(exit_code::INTERNAL);
                    break;
                }
            };
            self.hooks.on_trying(lookup.qname(), &lookup);

            let span = info_span!("lookup", n = %lookup.qname(), t = ?lookup.qtype());
            let drive_ctx = DriveCtx {
                opts: &self.opts,
                search: &self.search,
                counters: self.counters.clone(),
                hooks: self.hooks.as_ref(),
                cancel: &self.cancel,
            };
            let outcome = drive::drive_lookup(&drive_ctx, &mut lookup).instrument(span).await;
            lookup.clear();

            for followup in outcome.followups.into_iter().rev() {
                self.queue.push_front(followup);
            }

            match outcome.disposition {
                Disposition::Answered | Disposition::Moved | Disposition::Canceled => {}
                Disposition::NoServers => {
                    error!("{}", Error::NoServers);
                    self.ratchet_exit(exit_code::NO_SERVERS);
                }
                Disposition::RecordLimit { count } => {
                    warn!("{}", Error::RecordLimit { count });
                    self.ratchet_exit(exit_code::RECORD_LIMIT);
                }
                Disposition::TransferFailed { reason } => {
                    error!("{}", Error::TransferFailed { reason });
                }
                Disposition::ParseFailed => {}
                Disposition::Fatal { reason } => {
                    error!("{}", reason);
                    self.ratchet_exit(exit_code::INTERNAL);
                    break;
                }
            }
        }

        self.hooks.on_shutdown();
        self.exit_code
    }
}
