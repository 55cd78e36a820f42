use std::net::Ipv4Addr;
use std::ops::Range;

use crate::error::{NatError, NatResult};

/// A client-supplied allocation hint. `Full` pins both address and port;
/// `IpOnly` pins just the address (the client sent a port of 0, meaning "any
/// port on this address"), per spec.md's three-way allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suggestion {
    Full(Ipv4Addr, u16),
    IpOnly(Ipv4Addr),
}

/// External endpoint pool: a set of NAT-owned IPv4 addresses crossed with a
/// port range. `allocate` implements the three-way round-robin-with-
/// suggestion policy: a client-suggested (address, port) is honored first if
/// it falls inside the pool and is free; failing that, a client-suggested
/// address alone is honored with a freshly picked free port on it; failing
/// that, the next free slot after the cursor is handed out, and the cursor
/// advances past it so the next caller (absent its own suggestion) gets a
/// different slot rather than racing the first client for the same one.
pub struct AllocatorState {
    external_ips: Vec<Ipv4Addr>,
    port_start: u16,
    port_end: u16,
    cursor: usize,
}

impl AllocatorState {
    pub fn new(external_ips: Vec<Ipv4Addr>, ports: Range<u16>) -> Self {
        AllocatorState {
            external_ips,
            port_start: ports.start,
            port_end: ports.end,
            cursor: 0,
        }
    }

    fn ports_per_ip(&self) -> usize {
        usize::from(self.port_end.saturating_sub(self.port_start))
    }

    fn pool_size(&self) -> usize {
        self.external_ips.len() * self.ports_per_ip()
    }

    fn slot_at(&self, index: usize) -> (Ipv4Addr, u16) {
        let ports_per_ip = self.ports_per_ip();
        let ip = self.external_ips[index / ports_per_ip];
        let port = self.port_start + (index % ports_per_ip) as u16;
        (ip, port)
    }

    fn in_pool(&self, ip: Ipv4Addr, port: u16) -> bool {
        port >= self.port_start && port < self.port_end && self.external_ips.contains(&ip)
    }

    /// Allocate an external (address, port) pair not currently in use.
    /// `is_taken` queries the NAT table's external index; it is passed in
    /// rather than the allocator owning a reference to the table so the
    /// allocator stays a pure pool-cursor and the table stays the single
    /// source of truth for what's actually mapped.
    ///
    /// Policy, in order (spec.md §4.2):
    /// 1. `Suggestion::Full(ip, port)`: honored verbatim if in-pool and free.
    /// 2. `Suggestion::IpOnly(ip)`: if `ip` is in the pool, the first free
    ///    port on it is handed out (this does not touch `self.cursor`; it is
    ///    a client pinning an address, not a round-robin draw).
    /// 3. Unrestricted round robin from `self.cursor`.
    pub fn allocate(
        &mut self,
        suggested: Option<Suggestion>,
        is_taken: impl Fn(Ipv4Addr, u16) -> bool,
    ) -> NatResult<(Ipv4Addr, u16)> {
        match suggested {
            Some(Suggestion::Full(ip, port)) => {
                if self.in_pool(ip, port) && !is_taken(ip, port) {
                    return Ok((ip, port));
                }
            }
            Some(Suggestion::IpOnly(ip)) => {
                if self.external_ips.contains(&ip) {
                    for port in self.port_start..self.port_end {
                        if !is_taken(ip, port) {
                            return Ok((ip, port));
                        }
                    }
                }
            }
            None => {}
        }

        let pool_size = self.pool_size();
        if pool_size == 0 {
            return Err(NatError::NoResources);
        }

        for _ in 0..pool_size {
            let slot = self.cursor;
            self.cursor = (self.cursor + 1) % pool_size;
            let (ip, port) = self.slot_at(slot);
            if !is_taken(ip, port) {
                return Ok((ip, port));
            }
        }

        Err(NatError::NoResources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(198, 51, 100, n)
    }

    #[test]
    fn honors_in_pool_free_suggestion() {
        let mut alloc = AllocatorState::new(vec![ip(1)], 40000..40010);
        let got = alloc
            .allocate(Some(Suggestion::Full(ip(1), 40005)), |_, _| false)
            .unwrap();
        assert_eq!(got, (ip(1), 40005));
    }

    #[test]
    fn falls_back_to_round_robin_when_suggestion_taken() {
        let mut alloc = AllocatorState::new(vec![ip(1)], 40000..40003);
        let got = alloc
            .allocate(Some(Suggestion::Full(ip(1), 40000)), |_, port| {
                port == 40000
            })
            .unwrap();
        assert_ne!(got, (ip(1), 40000));
    }

    #[test]
    fn ignores_out_of_pool_suggestion() {
        let mut alloc = AllocatorState::new(vec![ip(1)], 40000..40003);
        let got = alloc
            .allocate(Some(Suggestion::Full(ip(9), 1)), |_, _| false)
            .unwrap();
        assert_eq!(got.0, ip(1));
    }

    #[test]
    fn ip_only_suggestion_reuses_address_with_a_fresh_port() {
        let mut alloc = AllocatorState::new(vec![ip(1), ip(2)], 40000..40010);
        let got = alloc
            .allocate(Some(Suggestion::IpOnly(ip(2))), |_, port| port == 40000)
            .unwrap();
        assert_eq!(got.0, ip(2));
        assert_eq!(got.1, 40001);
    }

    #[test]
    fn ip_only_suggestion_outside_pool_falls_back_to_round_robin() {
        let mut alloc = AllocatorState::new(vec![ip(1)], 40000..40003);
        let got = alloc
            .allocate(Some(Suggestion::IpOnly(ip(9))), |_, _| false)
            .unwrap();
        assert_eq!(got.0, ip(1));
    }

    #[test]
    fn exhausted_pool_reports_no_resources() {
        let mut alloc = AllocatorState::new(vec![ip(1)], 40000..40002);
        let err = alloc.allocate(None, |_, _| true).unwrap_err();
        assert_eq!(err, NatError::NoResources);
    }

    #[test]
    fn cursor_advances_across_calls() {
        let mut alloc = AllocatorState::new(vec![ip(1)], 40000..40003);
        let first = alloc.allocate(None, |_, _| false).unwrap();
        let second = alloc.allocate(None, |_, _| false).unwrap();
        assert_ne!(first, second);
    }

    proptest::proptest! {
        /// Whatever the pool shape, a successful allocation always names an
        /// IP actually in the pool and a port inside the configured range.
        #[test]
        fn allocated_endpoint_is_always_in_pool(
            num_ips in 1usize..4,
            port_start in 40000u16..50000,
            port_span in 1u16..20,
        ) {
            let ips: Vec<Ipv4Addr> = (0..num_ips as u8).map(ip).collect();
            let port_end = port_start.saturating_add(port_span);
            let mut alloc = AllocatorState::new(ips.clone(), port_start..port_end);

            for _ in 0..(num_ips * usize::from(port_span)) {
                let (got_ip, got_port) = alloc.allocate(None, |_, _| false).unwrap();
                assert!(ips.contains(&got_ip));
                assert!(got_port >= port_start && got_port < port_end);
            }
        }

        /// A suggestion outside the pool is never honored, regardless of
        /// which slot happens to be free.
        #[test]
        fn out_of_pool_suggestion_is_never_returned(
            suggested_port in 0u16..40000,
        ) {
            let mut alloc = AllocatorState::new(vec![ip(1)], 40000..40010);
            let (_, got_port) = alloc
                .allocate(Some(Suggestion::Full(ip(1), suggested_port)), |_, _| false)
                .unwrap();
            assert_ne!(got_port, suggested_port);
        }
    }
}
