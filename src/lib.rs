pub mod engine;
pub mod error;
pub mod nameserver;
pub mod system_config;
pub mod utils;

pub use engine::{Engine, EngineOpts, LookupSpec};
pub use error::Error;
pub use hickory_proto::rr::{DNSClass, Name, RecordType};
pub use nameserver::ServerSpec;

pub type Result<T> = std::result::Result<T, error::Error>;
