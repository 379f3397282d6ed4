// Client Matching
//
// Precedence, highest first:
//   1. exact address
//   2. subnet (addr & mask)
//   3. netgroup membership
//   4. world export (`*`)
//   5. promiscuous catch-all
// Within a tier the client defined first in the exports file wins.
//
// A winner from tiers 2-5 is cached as an automatic client for the peer
// address, carrying copies of the winner's mounts, so later calls from the
// same peer resolve in one lookup.

use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

use super::{Client, ClientId, ClientKind, ExportTable, Mount};

/// Normalize a peer address; IPv4-mapped IPv6 peers are treated as IPv4
pub fn peer_ipv4(peer: IpAddr) -> Option<Ipv4Addr> {
    match peer {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn in_subnet(peer: Ipv4Addr, addr: Ipv4Addr, mask: Ipv4Addr) -> bool {
    u32::from(peer) & u32::from(mask) == u32::from(addr) & u32::from(mask)
}

impl ExportTable {
    /// Select the client record governing requests from `peer`
    pub fn match_client(&mut self, peer: IpAddr) -> Option<ClientId> {
        let v4 = peer_ipv4(peer);

        if let Some(addr) = v4 {
            if let Some(id) = self.find_exact(addr) {
                return Some(id);
            }
        }
        if let Some(id) = self.automatic.get(&peer) {
            return Some(*id);
        }

        let winner = self.find_wildcard(v4)?;
        Some(self.synthesize_automatic(peer, winner))
    }

    /// Client for `peer` without creating an automatic entry
    pub fn lookup_client(&self, peer: IpAddr) -> Option<ClientId> {
        let v4 = peer_ipv4(peer);
        v4.and_then(|addr| self.find_exact(addr))
            .or_else(|| self.automatic.get(&peer).copied())
            .or_else(|| self.find_wildcard(v4))
    }

    fn find_exact(&self, addr: Ipv4Addr) -> Option<ClientId> {
        self.clients()
            .find(|(_, c)| c.kind == ClientKind::Exact && c.addrs.contains(&addr))
            .map(|(id, _)| id)
    }

    fn find_wildcard(&self, v4: Option<Ipv4Addr>) -> Option<ClientId> {
        let tier = |pred: &dyn Fn(&Client) -> bool| {
            self.clients().find(|(_, c)| pred(c)).map(|(id, _)| id)
        };

        if let Some(addr) = v4 {
            let subnet = tier(&|c: &Client| match &c.kind {
                ClientKind::Subnet { mask } => c.addrs.iter().any(|a| in_subnet(addr, *a, *mask)),
                _ => false,
            });
            if subnet.is_some() {
                return subnet;
            }

            let netgroup = tier(&|c: &Client| match &c.kind {
                ClientKind::Netgroup { group } => self.netgroups.contains(group, addr),
                _ => false,
            });
            if netgroup.is_some() {
                return netgroup;
            }
        }

        tier(&|c: &Client| c.kind == ClientKind::Anonymous).or_else(|| self.default_client())
    }

    fn synthesize_automatic(&mut self, peer: IpAddr, winner: ClientId) -> ClientId {
        let addrs = peer_ipv4(peer).into_iter().collect();
        let id = self.push_client(Client::new(peer.to_string(), ClientKind::Automatic, addrs));

        // Copy mounts in sorted order, remapping parent links to the copies
        let originals: Vec<_> = self.client(winner).mounts.clone();
        let mut copies = Vec::with_capacity(originals.len());
        for orig in &originals {
            let source = self.mount(*orig).clone();
            copies.push(self.push_mount(Mount {
                client: id,
                parent: None,
                origin: Some(source.origin.unwrap_or(winner)),
                ..source
            }));
        }
        for (orig, copy) in originals.iter().zip(&copies) {
            let parent = self.mount(*orig).parent;
            self.mounts[copy.0].parent = parent
                .and_then(|p| originals.iter().position(|o| *o == p))
                .map(|i| copies[i]);
        }

        self.automatic.insert(peer, id);
        debug!(
            "Created automatic client {} from {} ({} mounts)",
            peer,
            self.client(winner).name,
            copies.len()
        );
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MountOptions, NetgroupResolver, NoNetgroups};
    use std::path::Path;
    use std::sync::Arc;

    struct OneGroup;

    impl NetgroupResolver for OneGroup {
        fn contains(&self, group: &str, addr: Ipv4Addr) -> bool {
            group == "lab" && addr == Ipv4Addr::new(192, 168, 7, 7)
        }
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn sample() -> ExportTable {
        let mut t = ExportTable::new(Arc::new(OneGroup));
        let opts = MountOptions::new(true);

        let exact = t.get_or_add_client("host5", ClientKind::Exact, vec![Ipv4Addr::new(10, 0, 0, 5)]);
        t.add_mount(exact, Path::new("/srv/exact"), opts.clone());

        let subnet = t.get_or_add_client(
            "10.0.0.0/255.0.0.0",
            ClientKind::Subnet {
                mask: Ipv4Addr::new(255, 0, 0, 0),
            },
            vec![Ipv4Addr::new(10, 0, 0, 0)],
        );
        t.add_mount(subnet, Path::new("/srv/subnet"), opts.clone());
        t.add_mount(subnet, Path::new("/srv/subnet/inner"), opts.clone());

        let wider = t.get_or_add_client(
            "10.0.0.0/255.255.0.0",
            ClientKind::Subnet {
                mask: Ipv4Addr::new(255, 255, 0, 0),
            },
            vec![Ipv4Addr::new(10, 0, 0, 0)],
        );
        t.add_mount(wider, Path::new("/srv/later"), opts.clone());

        let group = t.get_or_add_client(
            "@lab",
            ClientKind::Netgroup {
                group: "lab".to_string(),
            },
            vec![],
        );
        t.add_mount(group, Path::new("/srv/lab"), opts);
        t.link_parents();
        t
    }

    fn mount_paths(t: &ExportTable, id: ClientId) -> Vec<String> {
        t.mounts_of(id)
            .map(|(_, m)| m.path.display().to_string())
            .collect()
    }

    #[test]
    fn test_exact_beats_subnet() {
        let mut t = sample();
        let id = t.match_client(ip(10, 0, 0, 5)).unwrap();
        assert_eq!(t.client(id).kind, ClientKind::Exact);
    }

    #[test]
    fn test_subnet_first_defined_wins() {
        let mut t = sample();
        let id = t.match_client(ip(10, 0, 3, 4)).unwrap();
        assert_eq!(t.client(id).kind, ClientKind::Automatic);
        assert_eq!(mount_paths(&t, id), vec!["/srv/subnet/inner", "/srv/subnet"]);

        // Parent links point at the copies, origin at the subnet client
        let mounts: Vec<_> = t.mounts_of(id).collect();
        assert_eq!(mounts[0].1.parent, Some(mounts[1].0));
        let origin = mounts[0].1.origin.unwrap();
        assert_eq!(t.client(origin).name, "10.0.0.0/255.0.0.0");
    }

    #[test]
    fn test_netgroup_and_no_match() {
        let mut t = sample();
        let id = t.match_client(ip(192, 168, 7, 7)).unwrap();
        assert_eq!(mount_paths(&t, id), vec!["/srv/lab"]);
        assert!(t.match_client(ip(192, 168, 7, 8)).is_none());
    }

    #[test]
    fn test_match_is_deterministic() {
        let mut t = sample();
        for peer in [ip(10, 0, 0, 5), ip(10, 9, 9, 9), ip(192, 168, 7, 7)] {
            let first = t.match_client(peer);
            let clients_after_first = t.clients().count();
            for _ in 0..3 {
                assert_eq!(t.match_client(peer), first);
            }
            // The automatic entry is created once, not per call
            assert_eq!(t.clients().count(), clients_after_first);
            assert_eq!(t.lookup_client(peer), first);
        }
    }

    #[test]
    fn test_anonymous_then_default() {
        let mut t = ExportTable::new(Arc::new(NoNetgroups));
        let default = t.get_or_add_client("(default)", ClientKind::Default, vec![]);
        t.add_mount(default, Path::new("/pub"), MountOptions::new(true));
        let world = t.get_or_add_client("*", ClientKind::Anonymous, vec![]);
        t.add_mount(world, Path::new("/world"), MountOptions::new(true));

        let id = t.match_client(ip(1, 2, 3, 4)).unwrap();
        assert_eq!(mount_paths(&t, id), vec!["/world"]);
    }

    #[test]
    fn test_mapped_ipv6_peer() {
        let mut t = sample();
        let mapped: IpAddr = "::ffff:10.0.0.5".parse().unwrap();
        let id = t.match_client(mapped).unwrap();
        assert_eq!(t.client(id).name, "host5");
    }
}
