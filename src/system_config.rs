// Copyright 2017-2021 Lukas Pustina <lukas@pustina.de>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Read operating system configuration for DNS resolving, i.e. read /etc/resolv.conf.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use resolv_conf::Config;

use crate::{Error, Result};

pub fn load_from_system_config<T: From<Config>>() -> Result<T> {
    load_from_system_config_path("/etc/resolv.conf")
}

pub fn load_from_system_config_path<T: From<Config>, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let mut buf = Vec::with_capacity(4096);
    let mut f = File::open(path)?;
    f.read_to_end(&mut buf)?;
    let cfg = resolv_conf::Config::parse(&buf).map_err(|e| Error::ParserError {
        what: format!("{}", path.to_string_lossy()),
        to: "",
        why: e.to_string(),
    })?;

    Ok(cfg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SearchList;
    use crate::nameserver::ServerGroup;

    use spectral::prelude::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CONF_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn write_conf(content: &str) -> std::path::PathBuf {
        let seq = CONF_SEQ.fetch_add(1, Ordering::SeqCst);
        let mut path = std::env::temp_dir();
        path.push(format!("mdig-resolv-{}-{}.conf", std::process::id(), seq));
        let mut f = File::create(&path).expect("failed to create temp resolv.conf");
        f.write_all(content.as_bytes()).expect("failed to write temp resolv.conf");
        path
    }

    #[test]
    fn nameservers_and_ndots() {
        crate::utils::tests::logging::init();
        let path = write_conf("nameserver 192.0.2.1\nnameserver 192.0.2.2\noptions ndots:3\n");

        let servers: ServerGroup = load_from_system_config_path(&path).expect("failed to load config");
        let search: SearchList = load_from_system_config_path(&path).expect("failed to load config");

        assert_that(&servers.servers().len()).is_equal_to(2);
        assert_that(&search.ndots()).is_equal_to(3);
    }

    #[test]
    fn empty_server_list_defaults_to_localhost() {
        crate::utils::tests::logging::init();
        let path = write_conf("options ndots:1\n");

        let servers: ServerGroup = load_from_system_config_path(&path).expect("failed to load config");

        assert_that(&servers.servers().len()).is_equal_to(1);
        assert_that(&servers.servers()[0].to_string()).is_equal_to("127.0.0.1:53".to_string());
    }

    #[test]
    fn domain_wins_over_search() {
        crate::utils::tests::logging::init();
        let path = write_conf("search one.example two.example\ndomain corp.example\n");

        let search: SearchList = load_from_system_config_path(&path).expect("failed to load config");

        let first = search.entries().first().expect("search list is empty").to_string();
        assert_that(&first).is_equal_to("corp.example.".to_string());
    }
}
