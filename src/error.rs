// Copyright 2017-2021 Lukas Pustina <lukas@pustina.de>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
/// Main Error type of this crate.
///
/// Must be `Send` because it used by async function which might run on different threads.
pub enum Error {
    #[error("internal error: {msg}")]
    InternalError { msg: &'static str },
    #[error("query engine failed")]
    EngineError {
        #[from]
        source: crate::engine::Error,
    },
    #[error("failed to parse '{what}' to {to} because {why}")]
    ParserError {
        what: String,
        to: &'static str,
        why: String,
    },
    #[error("failed to execute IO operation")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// Process exit codes, compatible with the dig family of tools.
///
/// The engine ratchets its exit code monotonically upward, i.e. a later, more
/// severe outcome replaces an earlier, milder one but never the other way
/// around.
pub mod exit_code {
    /// Normal termination, including NXDOMAIN answers.
    pub const OK: u8 = 0;
    /// Usage error, e.g. a syntactically invalid name.
    pub const USAGE: u8 = 1;
    /// A zone transfer hit the configured record limit.
    pub const RECORD_LIMIT: u8 = 7;
    /// A batch file could not be read or parsed.
    pub const BATCH_FILE: u8 = 8;
    /// No server could be reached for at least one lookup.
    pub const NO_SERVERS: u8 = 9;
    /// Internal error, e.g. a length prefix exceeding the receive buffer.
    pub const INTERNAL: u8 = 10;
}
