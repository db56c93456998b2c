use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use weft_dag::NodeSpec;
use weft_data::DataRef;

use crate::fleet::{ServerFleet, ServerInfo};

/// Why a server was chosen, surfaced on the status API for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementReason {
    SessionAffinity,
    DataLocality,
    RoundRobin,
}

#[derive(Debug, Clone)]
pub struct Placement {
    pub server: String,
    pub reason: PlacementReason,
}

/// Pick a target server for one ready node.
///
/// Ranked criteria: (1) session affinity, a server already holding the
/// node's warm session or model; (2) data locality, the candidate
/// holding the largest share of required input bytes; ties and the
/// no-signal case fall through to the round-robin counter.
///
/// `session_server` is the engine's remembered affinity for the node's
/// session hint, if any. `avoid` removes one server from consideration
/// (retry after a server-level fault) unless it is the only one left.
pub fn select_server(
    fleet: &ServerFleet,
    node: &NodeSpec,
    inputs: &[DataRef],
    session_server: Option<&str>,
    avoid: Option<&str>,
) -> Option<Placement> {
    let mut candidates: Vec<ServerInfo> = fleet
        .healthy()
        .into_iter()
        .filter(|s| s.supports(&node.node_type))
        .collect();

    if let Some(avoid) = avoid {
        if candidates.len() > 1 {
            candidates.retain(|s| s.address != avoid);
        }
    }

    if candidates.is_empty() {
        return None;
    }

    // 1. Session affinity: remembered placement first, then any server
    //    that already has the declared model warm.
    if let Some(preferred) = session_server {
        if let Some(server) = candidates.iter().find(|s| s.address == preferred) {
            return Some(Placement {
                server: server.address.clone(),
                reason: PlacementReason::SessionAffinity,
            });
        }
    }
    if let Some(hint) = node.session_hint() {
        if let Some(server) = candidates.iter().find(|s| s.has_model(hint)) {
            return Some(Placement {
                server: server.address.clone(),
                reason: PlacementReason::SessionAffinity,
            });
        }
    }

    // 2. Data locality: total input bytes already resident per candidate.
    let mut bytes_held: HashMap<&str, u64> = HashMap::new();
    for input in inputs {
        if let Some(server) = candidates.iter().find(|s| input.is_local_to(&s.address)) {
            *bytes_held.entry(server.address.as_str()).or_insert(0) += input.size_bytes;
        }
    }
    let max_bytes = bytes_held.values().copied().max().unwrap_or(0);
    if max_bytes > 0 {
        // Byte ties fall to the round-robin counter like everything else.
        let mut top: Vec<&str> = bytes_held
            .iter()
            .filter(|(_, bytes)| **bytes == max_bytes)
            .map(|(address, _)| *address)
            .collect();
        top.sort_unstable();
        let pick = if top.len() == 1 {
            top[0]
        } else {
            top[fleet.next_rr() % top.len()]
        };
        debug!(server = pick, bytes = max_bytes, "Placement by data locality");
        return Some(Placement {
            server: pick.to_string(),
            reason: PlacementReason::DataLocality,
        });
    }

    // 3. Round-robin across the remaining candidates.
    let idx = fleet.next_rr() % candidates.len();
    Some(Placement {
        server: candidates[idx].address.clone(),
        reason: PlacementReason::RoundRobin,
    })
}

/// Sleep duration for a computed backoff delay, with 0.8–1.2x jitter so
/// synchronized retries do not stampede one server. The logged delay
/// stays exact; only the sleep wobbles.
pub fn jittered(delay_ms: u64) -> Duration {
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((delay_ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_data::PayloadKind;

    fn fleet_of(addresses: &[&str]) -> ServerFleet {
        let fleet = ServerFleet::new();
        for addr in addresses {
            fleet.upsert(ServerInfo::new(addr));
        }
        fleet
    }

    fn node() -> NodeSpec {
        NodeSpec::new("code.python", "script")
    }

    #[test]
    fn empty_fleet_yields_none() {
        let fleet = ServerFleet::new();
        assert!(select_server(&fleet, &node(), &[], None, None).is_none());
    }

    #[test]
    fn session_affinity_wins_over_locality() {
        let fleet = fleet_of(&["http://a", "http://b"]);
        let big_input = DataRef::new("http://b", Uuid::new_v4(), 1 << 30, PayloadKind::Bytes);

        let placement =
            select_server(&fleet, &node(), &[big_input], Some("http://a"), None).unwrap();
        assert_eq!(placement.server, "http://a");
        assert_eq!(placement.reason, PlacementReason::SessionAffinity);
    }

    #[test]
    fn warm_model_attracts_node() {
        let fleet = fleet_of(&["http://a"]);
        let mut warm = ServerInfo::new("http://b");
        warm.loaded_models = vec!["qwen-7b".to_string()];
        fleet.upsert(warm);

        let node = NodeSpec::new("ai.chat", "chat")
            .with_config(serde_json::json!({"model": "qwen-7b"}));
        let placement = select_server(&fleet, &node, &[], None, None).unwrap();
        assert_eq!(placement.server, "http://b");
        assert_eq!(placement.reason, PlacementReason::SessionAffinity);
    }

    #[test]
    fn locality_prefers_largest_byte_share() {
        let fleet = fleet_of(&["http://a", "http://b"]);
        let wf = Uuid::new_v4();
        let inputs = vec![
            DataRef::new("http://a", wf, 100, PayloadKind::Bytes),
            DataRef::new("http://b", wf, 10_000, PayloadKind::Bytes),
            DataRef::new("http://a", wf, 50, PayloadKind::Bytes),
        ];

        let placement = select_server(&fleet, &node(), &inputs, None, None).unwrap();
        assert_eq!(placement.server, "http://b");
        assert_eq!(placement.reason, PlacementReason::DataLocality);
    }

    #[test]
    fn no_signal_round_robins_across_fleet() {
        let fleet = fleet_of(&["http://a", "http://b", "http://c"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let placement = select_server(&fleet, &node(), &[], None, None).unwrap();
            assert_eq!(placement.reason, PlacementReason::RoundRobin);
            seen.insert(placement.server);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn avoid_filters_faulted_server_when_possible() {
        let fleet = fleet_of(&["http://a", "http://b"]);
        for _ in 0..4 {
            let placement =
                select_server(&fleet, &node(), &[], None, Some("http://a")).unwrap();
            assert_eq!(placement.server, "http://b");
        }

        // A single-server fleet keeps using the faulted server.
        let lone = fleet_of(&["http://a"]);
        let placement = select_server(&lone, &node(), &[], None, Some("http://a")).unwrap();
        assert_eq!(placement.server, "http://a");
    }

    #[test]
    fn unhealthy_servers_excluded() {
        let fleet = fleet_of(&["http://a", "http://b"]);
        fleet.set_health("http://a", false);
        for _ in 0..3 {
            let placement = select_server(&fleet, &node(), &[], None, None).unwrap();
            assert_eq!(placement.server, "http://b");
        }
    }

    #[test]
    fn jitter_stays_within_band() {
        for _ in 0..100 {
            let d = jittered(1000).as_millis() as u64;
            assert!((800..=1200).contains(&d), "jittered delay {} out of band", d);
        }
    }
}
