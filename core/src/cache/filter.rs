//! Cache transform rules applied at replication boundaries

use super::{CacheSnapshot, Service};

/// Whether `incoming` may replace `local` during a merge.
///
/// A copy reached through the same gateway is a refresh and always wins. A
/// copy reached through a different gateway wins only with strictly fewer
/// hops; ties keep the local copy.
pub fn inbound_accepts(local: &Service, incoming: &Service) -> bool {
    if local.route() == incoming.route() {
        return true;
    }
    incoming.hops < local.hops
}

/// Shape `snapshot` for `recipient` on `network`.
///
/// Drops the recipient's own entries and temporary ones, keeps only the
/// `network` presence of each service, and re-routes services left without
/// any presence through `local_id` one hop further away.
pub fn outbound(snapshot: &CacheSnapshot, recipient: &str, network: &str, local_id: &str) -> CacheSnapshot {
    let services = snapshot
        .services
        .iter()
        .filter(|service| service.owner != recipient && !service.tmp)
        .map(|service| {
            let mut copy = service.clone();
            copy.networks.retain(|n| n == network);
            if copy.networks.is_empty() {
                copy.gateway = Some(local_id.to_string());
                copy.hops += 1;
            }
            copy
        })
        .collect();

    CacheSnapshot {
        origin: snapshot.origin.clone(),
        update_id: snapshot.update_id,
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(owner: &str, gateway: Option<&str>, hops: u32, networks: &[&str]) -> Service {
        let mut s = Service::new("printer", owner);
        s.gateway = gateway.map(str::to_string);
        s.hops = hops;
        s.networks = networks.iter().map(|n| n.to_string()).collect();
        s
    }

    #[test]
    fn test_inbound_tie_keeps_local() {
        let local = service("x", Some("g1"), 2, &["wifi"]);
        let equal = service("x", Some("g2"), 2, &["wifi"]);
        let closer = service("x", Some("g2"), 1, &["wifi"]);
        assert!(!inbound_accepts(&local, &equal));
        assert!(inbound_accepts(&local, &closer));
    }

    #[test]
    fn test_inbound_same_gateway_refreshes() {
        let local = service("x", Some("g1"), 1, &["wifi"]);
        let farther = service("x", Some("g1"), 3, &["wifi"]);
        assert!(inbound_accepts(&local, &farther));
    }

    #[test]
    fn test_outbound_keeps_only_target_network() {
        let snapshot = CacheSnapshot {
            origin: "me".into(),
            update_id: 4,
            services: vec![service("x", None, 0, &["a", "b"])],
        };
        let out = outbound(&snapshot, "peer", "a", "me");
        let s = &out.services[0];
        assert_eq!(s.networks.iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(s.gateway, None);
        assert_eq!(s.hops, 0);
        assert_eq!(out.update_id, 4);
    }

    #[test]
    fn test_outbound_reroutes_absent_service() {
        let snapshot = CacheSnapshot {
            origin: "me".into(),
            update_id: 1,
            services: vec![service("x", None, 1, &["b"])],
        };
        let out = outbound(&snapshot, "peer", "a", "me");
        let s = &out.services[0];
        assert!(s.networks.is_empty());
        assert_eq!(s.gateway.as_deref(), Some("me"));
        assert_eq!(s.hops, 2);
    }

    #[test]
    fn test_outbound_drops_recipient_and_tmp() {
        let mut tmp = service("x", None, 0, &["a"]);
        tmp.tmp = true;
        let snapshot = CacheSnapshot {
            origin: "me".into(),
            update_id: 1,
            services: vec![tmp, service("peer", None, 0, &["a"]), service("y", None, 0, &["a"])],
        };
        let out = outbound(&snapshot, "peer", "a", "me");
        assert_eq!(out.services.len(), 1);
        assert_eq!(out.services[0].owner, "y");
    }
}
