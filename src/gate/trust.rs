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

//! Trust gating for the front gate's two transports (spec.md §4.8): the
//! IPC socket trusts same-uid peers, the admin HTTP surface trusts a
//! configured CIDR allowlist.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy)]
struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    fn parse(s: &str) -> Option<Cidr> {
        let (addr, len) = s.split_once('/')?;
        Some(Cidr { network: addr.parse().ok()?, prefix_len: len.parse().ok()? })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 { 0 } else { u32::MAX << (32 - self.prefix_len) };
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 { 0u128 } else { u128::MAX << (128 - self.prefix_len) };
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

pub struct TrustPolicy {
    trusted_cidrs: Vec<Cidr>,
    /// uid of the process that started the daemon; only IPC peers with
    /// this uid are trusted on Unix (spec.md §4.8 "must be owned by the
    /// invoking user").
    #[cfg_attr(not(unix), allow(dead_code))]
    owner_uid: u32,
}

impl TrustPolicy {
    pub fn new(trusted_cidrs: &[String], owner_uid: u32) -> TrustPolicy {
        TrustPolicy {
            trusted_cidrs: trusted_cidrs.iter().filter_map(|s| Cidr::parse(s)).collect(),
            owner_uid,
        }
    }

    pub fn accepts_ip(&self, ip: IpAddr) -> bool {
        self.trusted_cidrs.iter().any(|c| c.contains(ip))
    }

    #[cfg(unix)]
    pub fn accepts_unix_peer(&self, uid: u32) -> bool {
        uid == self.owner_uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_cidr_trusts_loopback_only() {
        let policy = TrustPolicy::new(&["127.0.0.1/32".to_string()], 1000);
        assert!(policy.accepts_ip("127.0.0.1".parse().unwrap()));
        assert!(!policy.accepts_ip("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn wider_prefix_trusts_whole_subnet() {
        let policy = TrustPolicy::new(&["10.0.0.0/8".to_string()], 1000);
        assert!(policy.accepts_ip("10.1.2.3".parse().unwrap()));
        assert!(!policy.accepts_ip("11.0.0.1".parse().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn unix_peer_trust_requires_matching_uid() {
        let policy = TrustPolicy::new(&[], 1000);
        assert!(policy.accepts_unix_peer(1000));
        assert!(!policy.accepts_unix_peer(1001));
    }
}
