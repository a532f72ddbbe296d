use std::net::IpAddr;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use data_encoding::BASE64;
use hickory_proto::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::op::Message;
use tracing::warn;

use mdig::engine::{Engine, EngineHooks, EngineOpts, LookupSpec, Query, ReceivedInfo, TsigKey};
use mdig::error::exit_code;
use mdig::{DNSClass, Name, RecordType, ServerSpec};

mod logging {
    use anyhow::Result;
    use tracing::subscriber::set_global_default;
    use tracing_log::LogTracer;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::EnvFilter;

    pub fn start(verbosity: u8) -> Result<()> {
        // Subscribe to all log crate log messages and transform them to a tracing events
        LogTracer::init()?;

        let log_level = match verbosity {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        let filter = if std::env::var_os("RUST_LOG").is_some() {
            // This is controlled by the env variable RUST_LOG and overrides the max level, if set
            EnvFilter::from_default_env()
        } else {
            EnvFilter::from(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        };

        let fmt = fmt::layer().with_ansi(true).with_target(false);
        let registry = tracing_subscriber::registry().with(filter).with(fmt);
        set_global_default(registry)?;

        Ok(())
    }
}

fn create_parser() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("arguments")
                .num_args(0..)
                .help("Name to look up, optionally preceded by @SERVER and followed by TYPE and CLASS"),
        )
        .arg(
            Arg::new("reverse")
                .short('x')
                .long("reverse")
                .action(ArgAction::SetTrue)
                .help("Reverse lookup: NAME is an address and the PTR name is derived from it"),
        )
        .arg(
            Arg::new("batch-file")
                .short('f')
                .long("batch-file")
                .value_name("FILE")
                .help("Reads lookups from FILE, one per line as 'NAME [TYPE]'"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Queries this port instead of 53"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("DURATION")
                .help("Overrides the per-transport timeouts, e.g. '3s'; 0 restores the defaults"),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .value_name("NUMBER")
                .help("Attempts per lookup before giving up [default: 3]"),
        )
        .arg(
            Arg::new("tcp")
                .long("tcp")
                .action(ArgAction::SetTrue)
                .help("Uses TCP instead of UDP"),
        )
        .arg(
            Arg::new("no-recurse")
                .long("no-recurse")
                .action(ArgAction::SetTrue)
                .help("Clears the RD bit"),
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .action(ArgAction::SetTrue)
                .help("Walks the delegation chain from the root"),
        )
        .arg(
            Arg::new("dnssec")
                .long("dnssec")
                .action(ArgAction::SetTrue)
                .help("Sets the DO bit and requests DNSSEC records"),
        )
        .arg(
            Arg::new("bufsize")
                .long("bufsize")
                .value_name("BYTES")
                .help("EDNS0 UDP payload size to advertise"),
        )
        .arg(
            Arg::new("ignore-tc")
                .long("ignore-tc")
                .action(ArgAction::SetTrue)
                .help("Does not retry over TCP on truncated responses"),
        )
        .arg(
            Arg::new("no-fail")
                .long("no-fail")
                .action(ArgAction::SetTrue)
                .help("Tries the next server on SERVFAIL instead of stopping"),
        )
        .arg(
            Arg::new("best-effort")
                .long("best-effort")
                .action(ArgAction::SetTrue)
                .help("Tolerates malformed responses"),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .value_name("SERIAL")
                .help("Requests an IXFR from this SOA serial"),
        )
        .arg(
            Arg::new("rr-limit")
                .long("rr-limit")
                .value_name("NUMBER")
                .help("Aborts zone transfers after this many records"),
        )
        .arg(
            Arg::new("source")
                .short('b')
                .long("source")
                .value_name("ADDRESS")
                .help("Binds queries to this source address"),
        )
        .arg(
            Arg::new("domain")
                .long("domain")
                .value_name("DOMAIN")
                .help("Fixed search origin for relative names"),
        )
        .arg(
            Arg::new("no-search")
                .long("no-search")
                .action(ArgAction::SetTrue)
                .help("Does not apply the search list to relative names"),
        )
        .arg(
            Arg::new("tsig-key")
                .short('y')
                .long("tsig-key")
                .value_name("ALG:NAME:SECRET")
                .help("Signs queries with this TSIG key; SECRET is base64"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets level of verbosity"),
        )
}

/// Prints messages roughly the way the dig family does.
struct PrintHooks;

impl EngineHooks for PrintHooks {
    fn on_trying(&self, name: &Name, lookup: &mdig::engine::Lookup) {
        println!(";; Trying \"{}\" {:?}", name, lookup.qtype());
    }

    fn on_message(&self, query: &Query, message: &Message) {
        let header = message.header();
        println!(
            ";; ->>HEADER<<- opcode: {:?}, status: {:?}, id: {}",
            message.op_code(),
            message.response_code(),
            message.id()
        );
        println!(
            ";; QUERY: {}, ANSWER: {}, AUTHORITY: {}, ADDITIONAL: {}",
            header.query_count(),
            header.answer_count(),
            header.name_server_count(),
            header.additional_count()
        );
        for question in message.queries() {
            println!(";{}\t\t{:?}\t{:?}", question.name(), question.query_class(), question.query_type());
        }
        for record in message.answers() {
            println!("{}", record);
        }
        if !message.name_servers().is_empty() {
            println!(";; AUTHORITY SECTION:");
            for record in message.name_servers() {
                println!("{}", record);
            }
        }
        println!(";; SERVER: {}", query.server());
        println!();
    }

    fn on_received(&self, payload: &[u8], info: &ReceivedInfo) {
        println!(
            ";; Received {} bytes from {} in {} ms at {}",
            payload.len(),
            info.from,
            info.rtt.map(|rtt| rtt.as_millis()).unwrap_or_default(),
            info.when.to_rfc2822(),
        );
    }
}

struct ParsedArgs {
    servers: Vec<ServerSpec>,
    lookups: Vec<LookupSpec>,
    opts: EngineOpts,
    batch_failed: bool,
}

fn parse_tsig_key(value: &str) -> Result<TsigKey> {
    let mut parts = value.splitn(3, ':');
    let (alg, name, secret) = match (parts.next(), parts.next(), parts.next()) {
        (Some(alg), Some(name), Some(secret)) => (alg, name, secret),
        _ => return Err(anyhow!("TSIG key must be given as ALG:NAME:SECRET")),
    };
    let algorithm = match alg.to_lowercase().as_str() {
        "hmac-sha1" => TsigAlgorithm::HmacSha1,
        "hmac-sha256" => TsigAlgorithm::HmacSha256,
        "hmac-sha384" => TsigAlgorithm::HmacSha384,
        "hmac-sha512" => TsigAlgorithm::HmacSha512,
        other => return Err(anyhow!("unsupported TSIG algorithm '{}'", other)),
    };
    let name = Name::from_ascii(name).context("invalid TSIG key name")?;
    let secret = BASE64.decode(secret.as_bytes()).context("TSIG secret is not valid base64")?;
    Ok(TsigKey::new(name, algorithm, secret))
}

fn lookup_from_words(words: &[&str], args: &ArgMatches) -> Result<LookupSpec> {
    let mut name: Option<String> = None;
    let mut rdtype: Option<RecordType> = None;
    let mut rdclass: Option<DNSClass> = None;
    for word in words {
        if name.is_none() {
            name = Some((*word).to_string());
        } else if rdtype.is_none() {
            rdtype = Some(RecordType::from_str(&word.to_uppercase()).map_err(|_| anyhow!("unknown type '{}'", word))?);
        } else if rdclass.is_none() {
            rdclass = Some(DNSClass::from_str(&word.to_uppercase()).map_err(|_| anyhow!("unknown class '{}'", word))?);
        } else {
            return Err(anyhow!("unexpected argument '{}'", word));
        }
    }
    let name = name.ok_or_else(|| anyhow!("no name to look up"))?;

    let mut spec = if args.get_flag("reverse") {
        let addr = IpAddr::from_str(&name).context("reverse lookup requires an address")?;
        LookupSpec::reverse(addr)
    } else {
        match args.get_one::<String>("serial") {
            Some(serial) => LookupSpec::ixfr(name, serial.parse().context("invalid serial")?),
            None => LookupSpec::new(name, rdtype.unwrap_or(RecordType::A)),
        }
    };
    if let Some(rdclass) = rdclass {
        spec = spec.set_rdclass(rdclass);
    }
    spec = spec
        .set_recurse(!args.get_flag("no-recurse"))
        .set_trace(args.get_flag("trace"))
        .set_dnssec(args.get_flag("dnssec"))
        .set_tcp_mode(args.get_flag("tcp"))
        .set_ignore_tc(args.get_flag("ignore-tc"))
        .set_servfail_stops(!args.get_flag("no-fail"))
        .set_best_effort(args.get_flag("best-effort"));
    if let Some(retries) = args.get_one::<String>("retries") {
        spec = spec.set_retries(retries.parse().context("invalid retries")?);
    }
    if let Some(bufsize) = args.get_one::<String>("bufsize") {
        spec = spec.set_udpsize(bufsize.parse().context("invalid bufsize")?);
    }
    if let Some(timeout) = args.get_one::<String>("timeout") {
        spec = spec.set_timeout(humantime::parse_duration(timeout).context("invalid timeout")?);
    }
    if let Some(key) = args.get_one::<String>("tsig-key") {
        spec = spec.set_tsig(parse_tsig_key(key)?);
    }
    Ok(spec)
}

async fn parse_args(args: &ArgMatches) -> Result<ParsedArgs> {
    let port: Option<u16> = args
        .get_one::<String>("port")
        .map(|p| p.parse().context("invalid port"))
        .transpose()?;

    let mut servers: Vec<ServerSpec> = Vec::new();
    let mut words: Vec<&str> = Vec::new();
    if let Some(arguments) = args.get_many::<String>("arguments") {
        for argument in arguments {
            if let Some(server) = argument.strip_prefix('@') {
                let mut server: ServerSpec = server.parse()?;
                if let Some(port) = port {
                    server.set_port(port);
                }
                servers.push(server);
            } else {
                words.push(argument);
            }
        }
    }

    let mut opts = EngineOpts {
        usesearch: !args.get_flag("no-search"),
        ..EngineOpts::default()
    };
    if let Some(port) = port {
        opts.port = port;
    }
    if let Some(domain) = args.get_one::<String>("domain") {
        opts.domain_override = Some(Name::from_ascii(domain).context("invalid domain")?);
    }
    if let Some(rr_limit) = args.get_one::<String>("rr-limit") {
        opts.rr_limit = Some(rr_limit.parse().context("invalid rr-limit")?);
    }
    if let Some(source) = args.get_one::<String>("source") {
        opts.source = Some(source.parse().context("invalid source address")?);
    }

    let mut lookups = Vec::new();
    let mut batch_failed = false;
    if let Some(batch) = args.get_one::<String>("batch-file") {
        let content = tokio::fs::read_to_string(batch)
            .await
            .with_context(|| format!("failed to read batch file '{}'", batch))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            match lookup_from_words(&words, args) {
                Ok(spec) => lookups.push(spec.set_servers(servers.clone())),
                Err(e) => {
                    warn!("Skipping batch line '{}': {}", line, e);
                    batch_failed = true;
                }
            }
        }
    } else {
        lookups.push(lookup_from_words(&words, args)?.set_servers(servers.clone()));
    }

    Ok(ParsedArgs {
        servers,
        lookups,
        opts,
        batch_failed,
    })
}

async fn run() -> Result<u8> {
    let args = create_parser().get_matches();
    logging::start(args.get_count("v"))?;

    let parsed = match parse_args(&args).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let about_batch = e.to_string().contains("batch file");
            eprintln!("{}: {:#}", env!("CARGO_PKG_NAME"), e);
            return Ok(if about_batch {
                exit_code::BATCH_FILE
            } else {
                exit_code::USAGE
            });
        }
    };

    let mut engine = if parsed.servers.is_empty() {
        Engine::from_system_config(parsed.opts)?.with_hooks(PrintHooks)
    } else {
        let search = mdig::system_config::load_from_system_config::<mdig::engine::SearchList>().unwrap_or_default();
        Engine::new(parsed.servers, search, parsed.opts).with_hooks(PrintHooks)
    };

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel_all();
        }
    });

    for lookup in parsed.lookups {
        engine.seed(lookup);
    }
    let mut code = engine.run().await;
    if parsed.batch_failed {
        code = code.max(exit_code::BATCH_FILE);
    }
    Ok(code)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}: {:#}", env!("CARGO_PKG_NAME"), e);
            ExitCode::from(exit_code::INTERNAL)
        }
    }
}
