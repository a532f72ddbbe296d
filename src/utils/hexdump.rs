// Copyright 2017-2021 Lukas Pustina <lukas@pustina.de>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use data_encoding::HEXLOWER;

/// Formats raw message bytes as a hex dump, 16 octets per line, the way the
/// dig family prints responses it failed to parse.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (i, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:04x}:  ", i * 16));
        out.push_str(&HEXLOWER.encode(chunk));
        out.push('\n');
    }
    out
}
