//! Hash affinity selection strategy.

use std::sync::Arc;

use crate::load_balancer::DestinationSelector;
use crate::routing::Destination;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Identity string hashed for affinity: source IP followed by user agent.
pub fn client_identity(src_ip: &str, user_agent: &str) -> String {
    let mut identity = String::with_capacity(src_ip.len() + user_agent.len());
    identity.push_str(src_ip);
    identity.push_str(user_agent);
    identity
}

/// Selects `candidates[fnv1a32(client) % len]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AffinitySelector;

impl AffinitySelector {
    pub fn new() -> Self {
        Self
    }
}

impl DestinationSelector for AffinitySelector {
    fn select(&self, candidates: &[Arc<Destination>], client: &str) -> Option<Arc<Destination>> {
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].clone()),
            len => {
                let index = fnv1a32(client.as_bytes()) as usize % len;
                Some(candidates[index].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RouteKind;

    fn dest(id: i64) -> Arc<Destination> {
        Arc::new(Destination {
            id,
            route_kind: RouteKind::ReverseProxy,
            request_route: "/".into(),
            backend_route: "/".into(),
            destination: format!("10.0.0.{id}:80"),
            app_id: 1,
            node_id: 0,
        })
    }

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_single_candidate() {
        let only = dest(1);
        let selector = AffinitySelector::new();
        for client in ["1.1.1.1curl", "", "10.0.0.1Mozilla/5.0"] {
            let picked = selector.select(std::slice::from_ref(&only), client).unwrap();
            assert_eq!(picked.id, 1);
        }
    }

    #[test]
    fn test_affinity_is_stable() {
        let selector = AffinitySelector::new();
        let candidates = vec![dest(1), dest(2), dest(3)];
        let client = client_identity("203.0.113.9", "Mozilla/5.0");

        let first = selector.select(&candidates, &client).unwrap();
        for _ in 0..100 {
            assert_eq!(selector.select(&candidates, &client).unwrap().id, first.id);
        }
        let expected = fnv1a32(client.as_bytes()) as usize % 3;
        assert_eq!(first.id, candidates[expected].id);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(AffinitySelector::new().select(&[], "x").is_none());
    }
}
