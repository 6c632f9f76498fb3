// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use sccache_proxy::config::Config;
use sccache_proxy::errors::print_error_chain;

fn main() {
    let config = Config::parse();

    #[cfg(unix)]
    {
        if std::env::var_os("SCCACHE_PROXY_NO_DAEMONIZE").is_none() {
            if let Err(e) = daemonize::Daemonize::new().start() {
                eprintln!("error: failed to daemonize: {e}");
                std::process::exit(1);
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(sccache_proxy::run(config)) {
        print_error_chain(&anyhow::Error::from(e));
        std::process::exit(1);
    }
    std::process::exit(0);
}
