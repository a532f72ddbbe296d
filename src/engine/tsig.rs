//! TSIG plumbing for signed lookups and transfers.
//!
//! The cryptography itself lives in the wire codec; this module binds a key
//! to the outbound message and carries the verification context across the
//! messages of a multi-message TCP stream: the MAC of the signed query seeds
//! the chain, every verified response replaces it, and the second and later
//! messages of a stream are verified as TCP continuations.

use std::fmt;

use chrono::Utc;
use hickory_proto::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::dnssec::rdata::DNSSECRData;
use hickory_proto::dnssec::tsig::TSigner;
use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData};
use tracing::warn;

use crate::engine::Error;

/// Fudge the codec puts into the TSIG record, in seconds.
const TSIG_FUDGE: u16 = 300;

/// A shared secret for signing queries, as configured with `-y` or a key
/// file.
#[derive(Clone)]
pub struct TsigKey {
    pub name: Name,
    pub algorithm: TsigAlgorithm,
    secret: Vec<u8>,
}

impl TsigKey {
    pub fn new<S: Into<Vec<u8>>>(name: Name, algorithm: TsigAlgorithm, secret: S) -> TsigKey {
        TsigKey {
            name,
            algorithm,
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for TsigKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("TsigKey")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Per-lookup signing and verification state.
pub(crate) struct TsigSession {
    signer: TSigner,
    /// Query MAC before the first response, then the MAC of the last verified
    /// response.
    last_sig: Option<Vec<u8>>,
    valid: bool,
}

impl TsigSession {
    pub(crate) fn new(key: &TsigKey) -> Result<TsigSession, Error> {
        let signer = TSigner::new(
            key.secret.clone(),
            key.algorithm.clone(),
            key.name.clone(),
            TSIG_FUDGE,
        )?;
        Ok(TsigSession {
            signer,
            last_sig: None,
            valid: true,
        })
    }

    /// Signs the outbound message in place; the codec appends the TSIG record
    /// during finalization. The query's own MAC becomes the start of the
    /// verification chain.
    pub(crate) fn sign(&mut self, message: &mut Message) -> Result<(), Error> {
        message.finalize(&self.signer, Utc::now().timestamp() as u32)?;
        self.last_sig = extract_mac(message);
        Ok(())
    }

    /// Verifies one inbound message. `first` must be false for the second and
    /// subsequent messages of a TCP stream. A failed verification marks the
    /// session invalid but never aborts the lookup.
    pub(crate) fn verify(&mut self, message_bytes: &[u8], first: bool) -> bool {
        match self
            .signer
            .verify_message_byte(self.last_sig.as_deref(), message_bytes, first)
        {
            Ok((mac, _, _)) => {
                self.last_sig = Some(mac);
                true
            }
            Err(e) => {
                warn!("Couldn't verify signature: {}", e);
                self.valid = false;
                false
            }
        }
    }

    /// False once any message of this lookup failed verification.
    pub(crate) fn valid(&self) -> bool {
        self.valid
    }
}

impl fmt::Debug for TsigSession {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("TsigSession").field("valid", &self.valid).finish()
    }
}

fn extract_mac(message: &Message) -> Option<Vec<u8>> {
    message.signature().iter().rev().find_map(|rr| match rr.data() {
        RData::DNSSEC(DNSSECRData::TSIG(tsig)) => Some(tsig.mac().to_vec()),
        _ => None,
    })
}
