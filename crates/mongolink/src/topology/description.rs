//! What the driver believes about each server and the deployment as a whole
//!
//! `TopologyDescription::apply` is the only way a description changes. Each
//! call replaces one server's entry wholesale with a fresh probe result and
//! then re-derives membership and the topology type.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::trace;

use mongolink_common::Error;

use crate::address::ServerAddress;
use crate::handshake::HelloReply;

/// Weight of the newest sample in the round-trip average
pub const RTT_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    Unknown,
    Standalone,
    Primary,
    Secondary,
    Mongos,
    RsGhost,
    RsArbiter,
    /// Replica set member that is none of the above (hidden, recovering, ...)
    RsOther,
}

impl ServerRole {
    pub fn from_hello(reply: &HelloReply) -> Self {
        if reply.msg.as_deref() == Some("isdbgrid") {
            ServerRole::Mongos
        } else if reply.is_replica_set {
            ServerRole::RsGhost
        } else if reply.set_name.is_some() {
            if reply.hidden {
                ServerRole::RsOther
            } else if reply.is_writable_primary() {
                ServerRole::Primary
            } else if reply.secondary {
                ServerRole::Secondary
            } else if reply.arbiter_only {
                ServerRole::RsArbiter
            } else {
                ServerRole::RsOther
            }
        } else {
            ServerRole::Standalone
        }
    }

    /// Roles that carry a replica set host list
    pub fn is_replica_member(self) -> bool {
        matches!(
            self,
            ServerRole::Primary | ServerRole::Secondary | ServerRole::RsArbiter | ServerRole::RsOther
        )
    }

    /// Roles that can serve reads or writes
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerRole::Standalone | ServerRole::Primary | ServerRole::Secondary | ServerRole::Mongos
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Single,
    ReplicaSetWithPrimary,
    ReplicaSetNoPrimary,
    Sharded,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub role: ServerRole,
    pub max_wire_version: i32,
    pub round_trip_time: Option<Duration>,
    pub last_update: Option<Instant>,
    pub set_name: Option<String>,
    /// Members this server reports, including passives and arbiters
    pub hosts: Vec<ServerAddress>,
    pub primary: Option<ServerAddress>,
    pub hello_ok: bool,
    pub error: Option<String>,
}

impl ServerDescription {
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            role: ServerRole::Unknown,
            max_wire_version: 0,
            round_trip_time: None,
            last_update: None,
            set_name: None,
            hosts: Vec::new(),
            primary: None,
            hello_ok: false,
            error: None,
        }
    }

    /// Result of a failed probe
    pub fn failed(address: ServerAddress, error: &Error) -> Self {
        Self {
            last_update: Some(Instant::now()),
            error: Some(error.to_string()),
            ..Self::unknown(address)
        }
    }

    /// Result of a successful probe. Unparseable member addresses are skipped.
    pub fn from_hello(address: ServerAddress, reply: &HelloReply, round_trip_time: Duration) -> Self {
        Self {
            role: ServerRole::from_hello(reply),
            max_wire_version: reply.max_wire_version,
            round_trip_time: Some(round_trip_time),
            last_update: Some(Instant::now()),
            set_name: reply.set_name.clone(),
            hosts: reply
                .members()
                .filter_map(|m| ServerAddress::parse(m).ok())
                .collect(),
            primary: reply
                .primary
                .as_deref()
                .and_then(|p| ServerAddress::parse(p).ok()),
            hello_ok: reply.hello_ok,
            ..Self::unknown(address)
        }
    }

    pub fn is_available(&self) -> bool {
        self.role != ServerRole::Unknown
    }
}

/// Exponentially weighted moving average of round-trip samples
pub fn average_rtt(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        Some(prev) => Duration::from_secs_f64(
            RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * prev.as_secs_f64(),
        ),
        None => sample,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    ServerAdded(ServerAddress),
    ServerRemoved(ServerAddress),
    RoleChanged {
        address: ServerAddress,
        from: ServerRole,
        to: ServerRole,
    },
    TypeChanged {
        from: TopologyType,
        to: TopologyType,
    },
}

#[derive(Debug, Clone)]
pub struct TopologyDescription {
    topology_type: TopologyType,
    set_name: Option<String>,
    direct: bool,
    servers: BTreeMap<ServerAddress, ServerDescription>,
}

impl TopologyDescription {
    pub fn new(seeds: impl IntoIterator<Item = ServerAddress>, set_name: Option<String>, direct: bool) -> Self {
        let servers: BTreeMap<_, _> = seeds
            .into_iter()
            .map(|address| (address.clone(), ServerDescription::unknown(address)))
            .collect();
        let topology_type = if direct {
            TopologyType::Single
        } else if set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };
        Self {
            topology_type,
            set_name,
            direct,
            servers,
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers.values().find(|s| s.role == ServerRole::Primary)
    }

    /// Fold one probe result into the description. Results for servers no
    /// longer tracked are ignored.
    pub fn apply(&mut self, description: ServerDescription) -> Vec<TopologyEvent> {
        if !self.servers.contains_key(&description.address) {
            trace!(address = %description.address, "ignoring result for untracked server");
            return Vec::new();
        }

        let before_type = self.topology_type;
        let before: BTreeMap<ServerAddress, ServerRole> = self
            .servers
            .iter()
            .map(|(a, s)| (a.clone(), s.role))
            .collect();

        let address = description.address.clone();
        let role = description.role;
        self.servers.insert(address.clone(), description);

        if !self.direct {
            self.update_membership(&address, role);
        }
        self.topology_type = self.derive_type();

        self.diff(&before, before_type)
    }

    fn update_membership(&mut self, address: &ServerAddress, role: ServerRole) {
        match role {
            ServerRole::Standalone => {
                // A standalone only makes sense as the sole seed
                if self.servers.len() > 1 || self.set_name.is_some() {
                    self.servers.remove(address);
                }
            }
            role if role.is_replica_member() => {
                let reported_set = self.servers.get(address).and_then(|s| s.set_name.clone());
                if let Some(expected) = &self.set_name {
                    if reported_set.as_ref() != Some(expected) {
                        self.servers.remove(address);
                        return;
                    }
                } else {
                    self.set_name = reported_set;
                }

                if role == ServerRole::Primary {
                    self.demote_other_primaries(address);
                }
                self.add_reported_members(address);
                if role == ServerRole::Primary {
                    self.prune_to_primary_view(address);
                } else {
                    self.prune_by_quorum(address);
                }
            }
            _ => {}
        }
    }

    /// The newest primary report wins; older claims revert to Unknown until
    /// their next probe.
    fn demote_other_primaries(&mut self, current: &ServerAddress) {
        for (address, server) in &mut self.servers {
            if address != current && server.role == ServerRole::Primary {
                *server = ServerDescription {
                    error: Some(format!("superseded by newer primary {current}")),
                    ..ServerDescription::unknown(address.clone())
                };
            }
        }
    }

    fn add_reported_members(&mut self, reporter: &ServerAddress) {
        let reported = match self.servers.get(reporter) {
            Some(server) => server.hosts.clone(),
            None => return,
        };
        for member in reported {
            self.servers
                .entry(member.clone())
                .or_insert_with(|| ServerDescription::unknown(member));
        }
    }

    /// A primary's host list is authoritative
    fn prune_to_primary_view(&mut self, primary: &ServerAddress) {
        let keep: BTreeSet<ServerAddress> = match self.servers.get(primary) {
            Some(server) if !server.hosts.is_empty() => server.hosts.iter().cloned().collect(),
            _ => return,
        };
        self.servers
            .retain(|address, _| address == primary || keep.contains(address));
    }

    /// Without a primary, drop a member only once a majority of reporting
    /// members omit it.
    fn prune_by_quorum(&mut self, reporter: &ServerAddress) {
        if self.servers.values().any(|s| s.role == ServerRole::Primary) {
            return;
        }
        let doomed: Vec<ServerAddress> = {
            let reports: Vec<BTreeSet<&ServerAddress>> = self
                .servers
                .values()
                .filter(|s| s.role.is_replica_member() && !s.hosts.is_empty())
                .map(|s| s.hosts.iter().collect())
                .collect();
            if reports.is_empty() {
                return;
            }

            self.servers
                .keys()
                .filter(|address| *address != reporter)
                .filter(|address| {
                    let omitted = reports.iter().filter(|r| !r.contains(address)).count();
                    omitted * 2 > reports.len()
                })
                .cloned()
                .collect()
        };
        for address in doomed {
            self.servers.remove(&address);
        }
    }

    fn derive_type(&self) -> TopologyType {
        if self.direct {
            return TopologyType::Single;
        }
        let roles = || self.servers.values().map(|s| s.role);
        if roles().any(|r| r == ServerRole::Mongos) {
            TopologyType::Sharded
        } else if roles().any(|r| r == ServerRole::Primary) {
            TopologyType::ReplicaSetWithPrimary
        } else if self.set_name.is_some() || roles().any(|r| r.is_replica_member() || r == ServerRole::RsGhost) {
            TopologyType::ReplicaSetNoPrimary
        } else if self.servers.len() == 1 && roles().all(|r| r == ServerRole::Standalone) {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        }
    }

    fn diff(&self, before: &BTreeMap<ServerAddress, ServerRole>, before_type: TopologyType) -> Vec<TopologyEvent> {
        let mut events = Vec::new();
        for (address, role) in before {
            match self.servers.get(address) {
                None => events.push(TopologyEvent::ServerRemoved(address.clone())),
                Some(now) if now.role != *role => events.push(TopologyEvent::RoleChanged {
                    address: address.clone(),
                    from: *role,
                    to: now.role,
                }),
                Some(_) => {}
            }
        }
        for address in self.servers.keys() {
            if !before.contains_key(address) {
                events.push(TopologyEvent::ServerAdded(address.clone()));
            }
        }
        if self.topology_type != before_type {
            events.push(TopologyEvent::TypeChanged {
                from: before_type,
                to: self.topology_type,
            });
        }
        events
    }
}
