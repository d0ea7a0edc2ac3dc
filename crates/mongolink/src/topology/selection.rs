//! Server selection against a topology snapshot

use std::cmp::Ordering;

use mongolink_common::{Error, Result};

use crate::address::ServerAddress;
use crate::topology::description::{ServerDescription, ServerRole, TopologyDescription, TopologyType};

/// Which servers an operation may run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSelector {
    /// The server that accepts writes
    Writable,
    /// Any data-bearing server
    Any,
    /// Servers currently in exactly this role
    Role(ServerRole),
    /// Secondaries, falling back to the writable server
    SecondaryPreferred,
}

impl ServerSelector {
    pub fn candidates<'a>(&self, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription> {
        match self {
            ServerSelector::Writable => writable(topology),
            ServerSelector::Any => topology
                .servers()
                .filter(|s| s.role.is_data_bearing())
                .collect(),
            ServerSelector::Role(role) => topology.servers().filter(|s| s.role == *role).collect(),
            ServerSelector::SecondaryPreferred => {
                let secondaries: Vec<_> = topology
                    .servers()
                    .filter(|s| s.role == ServerRole::Secondary)
                    .collect();
                if secondaries.is_empty() {
                    writable(topology)
                } else {
                    secondaries
                }
            }
        }
    }
}

fn writable(topology: &TopologyDescription) -> Vec<&ServerDescription> {
    let role_ok: fn(ServerRole) -> bool = match topology.topology_type() {
        TopologyType::Single => |r| matches!(r, ServerRole::Standalone | ServerRole::Primary | ServerRole::Mongos),
        TopologyType::ReplicaSetWithPrimary => |r| r == ServerRole::Primary,
        TopologyType::Sharded => |r| r == ServerRole::Mongos,
        TopologyType::ReplicaSetNoPrimary | TopologyType::Unknown => |_| false,
    };
    topology.servers().filter(|s| role_ok(s.role)).collect()
}

/// Pick the lowest-latency candidate; ties fall back to address order
pub fn select(topology: &TopologyDescription, selector: &ServerSelector) -> Result<ServerAddress> {
    selector
        .candidates(topology)
        .into_iter()
        .min_by(|a, b| compare_latency(a, b))
        .map(|s| s.address.clone())
        .ok_or_else(|| {
            Error::NoServersAvailable(format!(
                "no server matches {selector:?} in {:?} topology",
                topology.topology_type()
            ))
        })
}

fn compare_latency(a: &ServerDescription, b: &ServerDescription) -> Ordering {
    match (a.round_trip_time, b.round_trip_time) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.address.cmp(&b.address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn member(address: &str, role: ServerRole, rtt_ms: u64) -> ServerDescription {
        ServerDescription {
            role,
            set_name: Some("rs0".into()),
            hosts: ["a:1", "b:1", "c:1"].map(addr).to_vec(),
            round_trip_time: Some(Duration::from_millis(rtt_ms)),
            ..ServerDescription::unknown(addr(address))
        }
    }

    fn replica_set() -> TopologyDescription {
        let mut topology = TopologyDescription::new(["a:1", "b:1", "c:1"].map(addr), None, false);
        topology.apply(member("a:1", ServerRole::Primary, 30));
        topology.apply(member("b:1", ServerRole::Secondary, 20));
        topology.apply(member("c:1", ServerRole::Secondary, 10));
        topology
    }

    #[test]
    fn test_writable_picks_primary() {
        assert_eq!(select(&replica_set(), &ServerSelector::Writable).unwrap(), addr("a:1"));
    }

    #[test]
    fn test_any_prefers_lowest_rtt() {
        assert_eq!(select(&replica_set(), &ServerSelector::Any).unwrap(), addr("c:1"));
    }

    #[test]
    fn test_role_selector() {
        let topology = replica_set();
        assert_eq!(
            select(&topology, &ServerSelector::Role(ServerRole::Secondary)).unwrap(),
            addr("c:1")
        );
        assert!(matches!(
            select(&topology, &ServerSelector::Role(ServerRole::RsArbiter)),
            Err(Error::NoServersAvailable(_))
        ));
    }

    #[test]
    fn test_secondary_preferred_falls_back() {
        let mut topology = TopologyDescription::new(["a:1", "b:1"].map(addr), None, false);
        topology.apply(member("a:1", ServerRole::Primary, 30));
        assert_eq!(
            select(&topology, &ServerSelector::SecondaryPreferred).unwrap(),
            addr("a:1")
        );
        topology.apply(member("b:1", ServerRole::Secondary, 40));
        assert_eq!(
            select(&topology, &ServerSelector::SecondaryPreferred).unwrap(),
            addr("b:1")
        );
    }

    #[test]
    fn test_no_primary_fails_writable() {
        let topology = TopologyDescription::new(["a:1"].map(addr), Some("rs0".into()), false);
        assert!(matches!(
            select(&topology, &ServerSelector::Writable),
            Err(Error::NoServersAvailable(_))
        ));
    }

    #[test]
    fn test_ties_break_on_address() {
        let mut topology = TopologyDescription::new(["a:1", "b:1", "c:1"].map(addr), None, false);
        topology.apply(member("c:1", ServerRole::Secondary, 10));
        topology.apply(member("b:1", ServerRole::Secondary, 10));
        assert_eq!(
            select(&topology, &ServerSelector::Role(ServerRole::Secondary)).unwrap(),
            addr("b:1")
        );
    }
}
