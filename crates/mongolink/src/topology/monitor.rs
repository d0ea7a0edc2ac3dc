//! Background topology monitoring
//!
//! One probe task per known server runs a hello check every heartbeat on its
//! own dedicated connection. Each result is folded into the shared
//! `TopologyDescription`; servers discovered through host lists get a probe
//! task of their own, servers dropped from the topology lose theirs.
//! Application connections are pooled separately, one multiplexed
//! connection per server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mongolink_common::{ClientConfig, Error, Result};

use crate::address::ServerAddress;
use crate::auth::Authenticator;
use crate::connection::Connection;
use crate::connector::Connector;
use crate::handshake::{self, ClientMetadata, HelloReply};
use crate::topology::description::{average_rtt, ServerDescription, TopologyDescription, TopologyEvent};
use crate::topology::selection::{self, ServerSelector};

pub type ChangeHook = Arc<dyn Fn(&TopologyEvent) + Send + Sync>;

struct ProbeHandle {
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

struct MonitorInner {
    heartbeat_interval: Duration,
    selection_timeout: Option<Duration>,
    operation_timeout: Duration,
    metadata: ClientMetadata,
    connector: Arc<dyn Connector>,
    authenticator: Option<Arc<dyn Authenticator>>,
    description: RwLock<TopologyDescription>,
    pool: DashMap<ServerAddress, Arc<Connection>>,
    probes: DashMap<ServerAddress, ProbeHandle>,
    hooks: RwLock<Vec<ChangeHook>>,
    changed: Notify,
    running: AtomicBool,
    shutdown: CancellationToken,
}

/// Shared handle to the monitor; clones observe the same topology
#[derive(Clone)]
pub struct TopologyMonitor {
    inner: Arc<MonitorInner>,
}

impl TopologyMonitor {
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Self> {
        config.validate()?;
        let seeds = config
            .seeds
            .iter()
            .map(|s| ServerAddress::parse(s))
            .collect::<Result<Vec<_>>>()?;

        let description = TopologyDescription::new(
            seeds,
            config.replica_set.clone(),
            config.direct_connection,
        );

        Ok(Self {
            inner: Arc::new(MonitorInner {
                heartbeat_interval: config.heartbeat_interval(),
                selection_timeout: config.server_selection_timeout(),
                operation_timeout: config.connect_timeout(),
                metadata: ClientMetadata::new(config.app_name.clone()),
                connector,
                authenticator,
                description: RwLock::new(description),
                pool: DashMap::new(),
                probes: DashMap::new(),
                hooks: RwLock::new(Vec::new()),
                changed: Notify::new(),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Spawn a probe task for every known server. Must run inside a tokio
    /// runtime; calling it twice is harmless.
    pub fn start(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let addresses: Vec<ServerAddress> = self.inner.description.read().addresses().cloned().collect();
        info!(seeds = addresses.len(), "starting topology monitor");
        for address in addresses {
            self.inner.spawn_probe(address);
        }
    }

    /// Stop every probe and close pooled connections
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.inner.probes.clear();
        for entry in self.inner.pool.iter() {
            entry.value().close();
        }
        self.inner.pool.clear();
        self.inner.changed.notify_waiters();
        info!("topology monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the current description
    pub fn description(&self) -> TopologyDescription {
        self.inner.description.read().clone()
    }

    /// Register a callback invoked for every topology event, in order
    pub fn on_change<F>(&self, hook: F)
    where
        F: Fn(&TopologyEvent) + Send + Sync + 'static,
    {
        self.inner.hooks.write().push(Arc::new(hook));
    }

    /// Fold a probe result into the topology and react to the resulting events
    pub fn apply_server_description(&self, description: ServerDescription) -> Vec<TopologyEvent> {
        self.inner.apply(description)
    }

    /// Record a failure observed outside the probe loop (e.g. a network
    /// error on an application connection) and re-probe the server now.
    pub fn mark_server_unknown(&self, address: &ServerAddress, error: &Error) {
        warn!(%address, %error, "marking server unknown");
        if let Some((_, connection)) = self.inner.pool.remove(address) {
            connection.close();
        }
        self.inner
            .apply(ServerDescription::failed(address.clone(), error));
        self.inner.request_check(address);
    }

    /// Ask for an immediate probe of every server
    pub fn request_immediate_check(&self) {
        for entry in self.inner.probes.iter() {
            entry.value().wake.notify_one();
        }
    }

    /// Pick a server for `selector`, waiting up to the configured selection
    /// timeout for one to appear.
    pub async fn select_server(&self, selector: &ServerSelector) -> Result<ServerAddress> {
        let deadline = self
            .inner
            .selection_timeout
            .map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let selected = selection::select(&self.inner.description.read(), selector);
            let error = match selected {
                Ok(address) => return Ok(address),
                Err(e) => e,
            };

            let Some(deadline) = deadline else {
                return Err(error);
            };
            if tokio::time::Instant::now() >= deadline || self.inner.shutdown.is_cancelled() {
                return Err(error);
            }

            self.request_immediate_check();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.inner.shutdown.cancelled() => {}
            }
        }
    }

    /// Select a server and return its pooled application connection,
    /// establishing and authenticating one if needed.
    pub async fn select_connection(&self, selector: &ServerSelector) -> Result<Arc<Connection>> {
        let address = self.select_server(selector).await?;
        self.connection_for(&address).await
    }

    pub async fn connection_for(&self, address: &ServerAddress) -> Result<Arc<Connection>> {
        if let Some(existing) = self.inner.pool.get(address).map(|c| Arc::clone(c.value())) {
            if !existing.is_closed() {
                return Ok(existing);
            }
            self.inner.pool.remove(address);
        }

        let connection = match self.inner.establish(address).await {
            Ok(connection) => Arc::new(connection),
            Err(e) if e.is_network_error() => {
                self.mark_server_unknown(address, &e);
                return Err(e);
            }
            Err(e) => {
                warn!(%address, error = %e, "discarding connection that failed setup");
                self.inner.request_check(address);
                return Err(e);
            }
        };

        let pooled = Arc::clone(
            self.inner
                .pool
                .entry(address.clone())
                .or_insert(connection)
                .value(),
        );
        Ok(pooled)
    }
}

impl MonitorInner {
    fn apply(self: &Arc<Self>, description: ServerDescription) -> Vec<TopologyEvent> {
        let events = self.description.write().apply(description);

        for event in &events {
            match event {
                TopologyEvent::ServerAdded(address) => {
                    info!(%address, "server added");
                    if self.running.load(Ordering::SeqCst) {
                        self.spawn_probe(address.clone());
                    }
                }
                TopologyEvent::ServerRemoved(address) => {
                    info!(%address, "server removed");
                    self.stop_probe(address);
                    if let Some((_, connection)) = self.pool.remove(address) {
                        connection.close();
                    }
                }
                TopologyEvent::RoleChanged { address, from, to } => {
                    info!(%address, ?from, ?to, "server role changed");
                }
                TopologyEvent::TypeChanged { from, to } => {
                    info!(?from, ?to, "topology type changed");
                }
            }
        }

        if !events.is_empty() {
            let hooks: Vec<ChangeHook> = self.hooks.read().clone();
            for event in &events {
                for hook in &hooks {
                    hook(event);
                }
            }
        }
        self.changed.notify_waiters();
        events
    }

    fn spawn_probe(self: &Arc<Self>, address: ServerAddress) {
        if self.probes.contains_key(&address) {
            return;
        }
        let handle = ProbeHandle {
            wake: Arc::new(Notify::new()),
            cancel: self.shutdown.child_token(),
        };
        let wake = Arc::clone(&handle.wake);
        let cancel = handle.cancel.clone();
        self.probes.insert(address.clone(), handle);
        tokio::spawn(probe_loop(Arc::downgrade(self), address, wake, cancel));
    }

    fn stop_probe(&self, address: &ServerAddress) {
        if let Some((_, handle)) = self.probes.remove(address) {
            handle.cancel.cancel();
        }
    }

    fn request_check(&self, address: &ServerAddress) {
        if let Some(handle) = self.probes.get(address) {
            handle.wake.notify_one();
        }
    }

    /// Probe once and fold the result in. `monitoring` is the probe's
    /// dedicated connection, replaced after any failure.
    async fn check_server(self: &Arc<Self>, address: &ServerAddress, monitoring: &mut Option<Connection>) {
        let previous_rtt = self
            .description
            .read()
            .server(address)
            .and_then(|s| s.round_trip_time);

        let description = match self.probe(address, monitoring).await {
            Ok((reply, sample)) => {
                ServerDescription::from_hello(address.clone(), &reply, average_rtt(previous_rtt, sample))
            }
            Err(e) => {
                debug!(%address, error = %e, "probe failed");
                *monitoring = None;
                if let Some((_, connection)) = self.pool.remove(address) {
                    connection.close();
                }
                ServerDescription::failed(address.clone(), &e)
            }
        };
        self.apply(description);
    }

    async fn probe(&self, address: &ServerAddress, monitoring: &mut Option<Connection>) -> Result<(HelloReply, Duration)> {
        if let Some(connection) = monitoring.as_ref().filter(|c| !c.is_closed()) {
            let hello_ok = self
                .description
                .read()
                .server(address)
                .map_or(false, |s| s.hello_ok);
            let started = Instant::now();
            let reply = handshake::check(connection, hello_ok, Some(self.operation_timeout)).await?;
            return Ok((reply, started.elapsed()));
        }

        let connection = self.connector.connect(address).await?;
        let started = Instant::now();
        let reply = handshake::initial_handshake(
            &connection,
            &self.metadata,
            None,
            Some(self.operation_timeout),
        )
        .await?;
        let sample = started.elapsed();
        *monitoring = Some(connection);
        Ok((reply, sample))
    }

    /// Open, handshake and authenticate an application connection
    async fn establish(&self, address: &ServerAddress) -> Result<Connection> {
        let connection = self.connector.connect(address).await?;
        let credentials = self.authenticator.as_ref().and_then(|a| a.credentials());
        let hello = handshake::initial_handshake(
            &connection,
            &self.metadata,
            credentials,
            Some(self.operation_timeout),
        )
        .await?;

        if let Some(authenticator) = &self.authenticator {
            if let Err(e) = authenticator.authenticate(&connection, &hello).await {
                connection.close();
                return Err(e);
            }
        }
        debug!(%address, connection_id = connection.id(), "application connection ready");
        Ok(connection)
    }
}

async fn probe_loop(
    inner: Weak<MonitorInner>,
    address: ServerAddress,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut monitoring: Option<Connection> = None;
    debug!(%address, "probe started");

    loop {
        let Some(monitor) = inner.upgrade() else {
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = monitor.check_server(&address, &mut monitoring) => {}
        }
        let interval = monitor.heartbeat_interval;
        drop(monitor);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }

    if let Some(connection) = monitoring {
        connection.close();
    }
    debug!(%address, "probe stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::description::{ServerRole, TopologyType};
    use async_trait::async_trait;
    use mongolink_common::NetworkError;
    use parking_lot::Mutex;

    /// Connector for tests that only exercise description handling
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, address: &ServerAddress) -> Result<Connection> {
            Err(NetworkError::ConnectionFailed {
                address: address.to_string(),
                reason: "unreachable".to_string(),
            }
            .into())
        }
    }

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn monitor(seeds: &[&str], selection_timeout_ms: u64) -> TopologyMonitor {
        let config = ClientConfig {
            server_selection_timeout_ms: selection_timeout_ms,
            ..ClientConfig::with_seeds(seeds.iter().copied())
        };
        TopologyMonitor::new(&config, Arc::new(Unreachable), None).unwrap()
    }

    fn member(address: &str, role: ServerRole) -> ServerDescription {
        ServerDescription {
            role,
            set_name: Some("rs0".into()),
            hosts: ["a:1", "b:1", "c:1"].map(addr).to_vec(),
            round_trip_time: Some(Duration::from_millis(1)),
            ..ServerDescription::unknown(addr(address))
        }
    }

    #[test]
    fn test_hooks_see_events_in_order() {
        let monitor = monitor(&["a:1", "b:1", "c:1"], 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_change(move |event| sink.lock().push(event.clone()));

        monitor.apply_server_description(member("a:1", ServerRole::Primary));
        monitor.apply_server_description(member("a:1", ServerRole::Secondary));

        let seen = seen.lock();
        assert!(seen.contains(&TopologyEvent::TypeChanged {
            from: TopologyType::Unknown,
            to: TopologyType::ReplicaSetWithPrimary,
        }));
        assert_eq!(
            seen.last(),
            Some(&TopologyEvent::TypeChanged {
                from: TopologyType::ReplicaSetWithPrimary,
                to: TopologyType::ReplicaSetNoPrimary,
            })
        );
    }

    #[tokio::test]
    async fn test_selection_fails_fast_without_timeout() {
        let monitor = monitor(&["a:1"], 0);
        let err = monitor.select_server(&ServerSelector::Writable).await.unwrap_err();
        assert!(matches!(err, Error::NoServersAvailable(_)));
    }

    #[tokio::test]
    async fn test_selection_waits_for_primary() {
        let monitor = monitor(&["a:1", "b:1", "c:1"], 2_000);
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.select_server(&ServerSelector::Writable).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.apply_server_description(member("b:1", ServerRole::Primary));
        assert_eq!(waiter.await.unwrap().unwrap(), addr("b:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_times_out() {
        let monitor = monitor(&["a:1"], 500);
        let started = tokio::time::Instant::now();
        let err = monitor.select_server(&ServerSelector::Writable).await.unwrap_err();
        assert!(matches!(err, Error::NoServersAvailable(_)));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_mark_unknown_clears_primary() {
        let monitor = monitor(&["a:1", "b:1", "c:1"], 0);
        monitor.apply_server_description(member("a:1", ServerRole::Primary));
        assert!(monitor.select_server(&ServerSelector::Writable).await.is_ok());

        monitor.mark_server_unknown(&addr("a:1"), &Error::ConnectionClosed);
        assert_eq!(monitor.description().topology_type(), TopologyType::ReplicaSetNoPrimary);
        assert!(monitor.select_server(&ServerSelector::Writable).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_marked_unknown_on_connect() {
        let monitor = monitor(&["a:1", "b:1", "c:1"], 0);
        monitor.apply_server_description(member("a:1", ServerRole::Primary));
        let err = monitor
            .select_connection(&ServerSelector::Writable)
            .await
            .unwrap_err();
        assert!(err.is_network_error());
        assert_eq!(
            monitor.description().server(&addr("a:1")).unwrap().role,
            ServerRole::Unknown
        );
    }

    #[tokio::test]
    async fn test_probes_mark_unreachable_seeds_unknown_with_error() {
        let config = ClientConfig {
            heartbeat_interval_ms: 500,
            ..ClientConfig::with_seeds(["a:1"])
        };
        let monitor = TopologyMonitor::new(&config, Arc::new(Unreachable), None).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        monitor.on_change(move |e| {
            let _ = tx.send(e.clone());
        });

        monitor.start();
        assert!(monitor.is_running());
        // A failed probe of an Unknown server changes nothing observable but
        // the recorded error
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if monitor
                    .description()
                    .server(&addr("a:1"))
                    .and_then(|s| s.error.clone())
                    .is_some()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());

        monitor.shutdown();
        assert!(!monitor.is_running());
    }
}
