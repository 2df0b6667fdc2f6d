//! Data-center endpoint table.
//!
//! Filled from configuration and consumed read-only: the client never
//! fetches `help.getConfig` itself, it only looks addresses up.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::BitOr;

// ─── Flags ────────────────────────────────────────────────────────────────────

/// Endpoint attributes, as published in `dcOption`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DcFlags(u8);

impl DcFlags {
    pub const NONE: Self = Self(0);
    pub const IPV6: Self = Self(1);
    pub const MEDIA_ONLY: Self = Self(2);
    pub const TCPO_ONLY: Self = Self(4);
    const MEDIA_TCPO: Self = Self(6);

    pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    pub fn bits(self) -> u8 { self.0 }
}

impl BitOr for DcFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

/// Wire transport an endpoint is wanted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Http,
}

// ─── Table ────────────────────────────────────────────────────────────────────

/// `(dc_id, flags) → [ip:port]`.
#[derive(Clone, Debug, Default)]
pub struct DcOptions {
    entries: BTreeMap<(i32, DcFlags), Vec<SocketAddr>>,
}

/// What [`DcOptions::lookup`] found for each address family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub v4: Option<SocketAddr>,
    pub v6: Option<SocketAddr>,
}

impl Endpoints {
    pub fn is_empty(&self) -> bool { self.v4.is_none() && self.v6.is_none() }
}

impl DcOptions {
    pub fn new() -> Self { Self::default() }

    /// Built-in production addresses, used until configuration supplies better ones.
    pub fn bootstrap() -> Self {
        let mut table = Self::new();
        let v4: [(i32, Ipv4Addr); 5] = [
            (1, Ipv4Addr::new(149, 154, 175, 53)),
            (2, Ipv4Addr::new(149, 154, 167, 51)),
            (3, Ipv4Addr::new(149, 154, 175, 100)),
            (4, Ipv4Addr::new(149, 154, 167, 91)),
            (5, Ipv4Addr::new(91, 108, 56, 130)),
        ];
        let v6: [(i32, Ipv6Addr); 5] = [
            (1, Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf001, 0, 0, 0, 0xa)),
            (2, Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf002, 0, 0, 0, 0xa)),
            (3, Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf003, 0, 0, 0, 0xa)),
            (4, Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf004, 0, 0, 0, 0xa)),
            (5, Ipv6Addr::new(0x2001, 0x0b28, 0xf23f, 0xf005, 0, 0, 0, 0xa)),
        ];
        for (dc, ip) in v4 {
            table.add(dc, DcFlags::NONE, SocketAddr::new(IpAddr::V4(ip), 443));
        }
        for (dc, ip) in v6 {
            table.add(dc, DcFlags::IPV6, SocketAddr::new(IpAddr::V6(ip), 443));
        }
        table
    }

    /// Add an endpoint. The IPv6 flag is derived from the address.
    pub fn add(&mut self, dc_id: i32, flags: DcFlags, addr: SocketAddr) {
        let flags = if addr.is_ipv6() { flags | DcFlags::IPV6 } else { flags };
        let list = self.entries.entry((dc_id, flags)).or_default();
        if !list.contains(&addr) {
            list.push(addr);
        }
    }

    /// Every dc id with at least one endpoint.
    pub fn dc_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.entries.keys().map(|&(dc, _)| dc).collect();
        ids.dedup();
        ids
    }

    pub fn has(&self, dc_id: i32) -> bool { self.entries.keys().any(|&(dc, _)| dc == dc_id) }

    /// Endpoints of `dc_id` for `protocol`, one per address family.
    ///
    /// Media-only endpoints are preferred for downloads once the DC has a
    /// key; TCPO-only endpoints are never used over HTTP.
    pub fn lookup(&self, dc_id: i32, protocol: Protocol, download_with_key: bool) -> Endpoints {
        let preference: &[DcFlags] = match (protocol, download_with_key) {
            (Protocol::Tcp, true) => &[
                DcFlags::MEDIA_TCPO,
                DcFlags::TCPO_ONLY,
                DcFlags::MEDIA_ONLY,
                DcFlags::NONE,
            ],
            (Protocol::Tcp, false) => &[DcFlags::TCPO_ONLY, DcFlags::NONE],
            (Protocol::Http, true) => &[DcFlags::MEDIA_ONLY, DcFlags::NONE],
            (Protocol::Http, false) => &[DcFlags::NONE],
        };
        let first = |family: DcFlags| {
            preference
                .iter()
                .find_map(|&flags| self.entries.get(&(dc_id, flags | family))?.first().copied())
        };
        Endpoints { v4: first(DcFlags::NONE), v6: first(DcFlags::IPV6) }
    }
}
