use crate::tunnel::{WgTunnel, WgTunnelConfig};
use crate::wg::WgInterface;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DYNAMIC_PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Invoked after a tunnel starts or stops so the routing layer outside this
/// crate can adjust the table. The default implementation does nothing.
pub trait RouteHook: Send + Sync {
    fn tunnel_started(&self, id: &str, local_addr: SocketAddr);
    fn tunnel_stopped(&self, id: &str);
}

pub struct NoopRouteHook;

impl RouteHook for NoopRouteHook {
    fn tunnel_started(&self, _id: &str, _local_addr: SocketAddr) {}
    fn tunnel_stopped(&self, _id: &str) {}
}

#[derive(Debug, Serialize)]
pub struct TunnelStatus {
    pub local_port: u16,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: String,
    pub use_tls: bool,
    pub bind_to_wg: bool,
    pub udp_over_tcp: bool,
    pub connections: usize,
}

/// Registry of named tunnels over one WireGuard interface. Constructed at
/// agent start and passed by reference to whoever needs it.
pub struct TunnelManager {
    iface: Arc<dyn WgInterface>,
    tunnels: Mutex<HashMap<String, Arc<WgTunnel>>>,
    route_hook: Box<dyn RouteHook>,
}

impl TunnelManager {
    pub fn new(iface: Arc<dyn WgInterface>) -> Self {
        Self::with_route_hook(iface, Box::new(NoopRouteHook))
    }

    pub fn with_route_hook(iface: Arc<dyn WgInterface>, route_hook: Box<dyn RouteHook>) -> Self {
        Self {
            iface,
            tunnels: Mutex::new(HashMap::new()),
            route_hook,
        }
    }

    /// Starts a tunnel under `id`. A second start with the same id is a
    /// no-op returning the running tunnel's address. Registration happens
    /// under the same lock acquisition as the start, so a half-registered
    /// tunnel is never observable.
    pub async fn start_tunnel(&self, id: &str, config: WgTunnelConfig) -> Result<SocketAddr> {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.get(id) {
            debug!(id, "tunnel already running");
            return existing.start().await;
        }
        let tunnel = Arc::new(WgTunnel::new(config, Arc::clone(&self.iface)));
        let addr = tunnel.start().await?;
        tunnels.insert(id.to_string(), tunnel);
        drop(tunnels);
        info!(id, local = %addr, "tunnel registered");
        self.route_hook.tunnel_started(id, addr);
        Ok(addr)
    }

    /// Stops and deregisters `id`; unknown ids are ignored.
    pub async fn stop_tunnel(&self, id: &str) {
        let tunnel = self.tunnels.lock().await.remove(id);
        if let Some(tunnel) = tunnel {
            tunnel.stop().await;
            info!(id, "tunnel deregistered");
            self.route_hook.tunnel_stopped(id);
        }
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.tunnels.lock().await.contains_key(id)
    }

    pub async fn tunnel_local_addr(&self, id: &str) -> Option<SocketAddr> {
        self.tunnels
            .lock()
            .await
            .get(id)
            .and_then(|tunnel| tunnel.local_addr())
    }

    pub async fn active_tunnels(&self) -> HashMap<String, TunnelStatus> {
        let tunnels = self.tunnels.lock().await;
        tunnels
            .iter()
            .map(|(id, tunnel)| {
                let config = tunnel.config();
                (
                    id.clone(),
                    TunnelStatus {
                        local_port: config.local_port,
                        local_addr: tunnel.local_addr(),
                        remote_addr: config.remote_addr.clone(),
                        use_tls: config.use_tls,
                        bind_to_wg: config.bind_to_wg,
                        udp_over_tcp: config.udp_over_tcp,
                        connections: tunnel.active_connections(),
                    },
                )
            })
            .collect()
    }

    pub async fn stop_all(&self) {
        let tunnels: Vec<_> = self.tunnels.lock().await.drain().collect();
        for (id, tunnel) in tunnels {
            tunnel.stop().await;
            self.route_hook.tunnel_stopped(&id);
        }
    }

    /// Scans the dynamic port range for a TCP port that binds. The result is
    /// a hint; the port can be taken again before the caller binds it.
    pub fn find_available_port(&self) -> Result<u16> {
        for port in DYNAMIC_PORT_RANGE {
            if TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok() {
                return Ok(port);
            }
        }
        warn!("dynamic port range exhausted");
        Err(anyhow!("no available port in the dynamic range"))
    }

    pub fn firewall_bypass_config(
        &self,
        local_port: u16,
        remote_addr: &str,
        use_tls: bool,
    ) -> WgTunnelConfig {
        WgTunnelConfig::firewall_bypass(local_port, remote_addr, use_tls)
    }

    /// Builds a firewall-bypass config on a freshly scanned local port, for
    /// standing up a fallback path when the direct one degrades.
    pub fn failover_config(&self, remote_addr: &str) -> Result<(WgTunnelConfig, u16)> {
        let port = self.find_available_port()?;
        Ok((WgTunnelConfig::firewall_bypass(port, remote_addr, false), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wg::StaticWgIface;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loopback_manager() -> TunnelManager {
        TunnelManager::new(Arc::new(StaticWgIface::new(
            "wg0",
            1420,
            vec!["127.0.0.1".parse().unwrap()],
        )))
    }

    fn loopback_config() -> WgTunnelConfig {
        let mut config = WgTunnelConfig::new(0, "127.0.0.1:51820");
        config.bind_to_wg = true;
        config
    }

    #[tokio::test]
    async fn duplicate_start_is_a_noop() {
        let manager = loopback_manager();
        let first = manager.start_tunnel("peer-a", loopback_config()).await.unwrap();
        let second = manager.start_tunnel("peer-a", loopback_config()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.active_tunnels().await.len(), 1);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn stop_tunnel_deregisters() {
        let manager = loopback_manager();
        manager.start_tunnel("peer-a", loopback_config()).await.unwrap();
        assert!(manager.is_active("peer-a").await);
        manager.stop_tunnel("peer-a").await;
        assert!(!manager.is_active("peer-a").await);
        assert!(manager.tunnel_local_addr("peer-a").await.is_none());
        // Stopping again is harmless.
        manager.stop_tunnel("peer-a").await;
    }

    #[tokio::test]
    async fn stop_all_resets_the_registry() {
        let manager = loopback_manager();
        manager.start_tunnel("peer-a", loopback_config()).await.unwrap();
        manager.start_tunnel("peer-b", loopback_config()).await.unwrap();
        manager.stop_all().await;
        assert!(manager.active_tunnels().await.is_empty());
    }

    #[test]
    fn found_port_is_in_the_dynamic_range_and_bindable() {
        let manager = loopback_manager();
        let port = manager.find_available_port().unwrap();
        assert!(DYNAMIC_PORT_RANGE.contains(&port));
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).unwrap();
    }

    #[test]
    fn canned_configs_carry_the_bypass_settings() {
        let manager = loopback_manager();
        let config = manager.firewall_bypass_config(51821, "10.0.0.2:443", true);
        assert!(config.bind_to_wg && config.udp_over_tcp && config.use_tls);

        let (config, port) = manager.failover_config("10.0.0.2:443").unwrap();
        assert!(DYNAMIC_PORT_RANGE.contains(&port));
        assert_eq!(config.local_port, port);
        assert!(config.bind_to_wg && config.udp_over_tcp && !config.use_tls);
    }

    #[tokio::test]
    async fn route_hook_observes_lifecycle() {
        struct Counter {
            started: AtomicUsize,
            stopped: AtomicUsize,
        }
        impl RouteHook for Counter {
            fn tunnel_started(&self, _id: &str, _local_addr: SocketAddr) {
                self.started.fetch_add(1, Ordering::SeqCst);
            }
            fn tunnel_stopped(&self, _id: &str) {
                self.stopped.fetch_add(1, Ordering::SeqCst);
            }
        }
        let hook = Arc::new(Counter {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        struct Shared(Arc<Counter>);
        impl RouteHook for Shared {
            fn tunnel_started(&self, id: &str, local_addr: SocketAddr) {
                self.0.tunnel_started(id, local_addr)
            }
            fn tunnel_stopped(&self, id: &str) {
                self.0.tunnel_stopped(id)
            }
        }
        let manager = TunnelManager::with_route_hook(
            Arc::new(StaticWgIface::new("wg0", 1420, vec!["127.0.0.1".parse().unwrap()])),
            Box::new(Shared(Arc::clone(&hook))),
        );
        manager.start_tunnel("peer-a", loopback_config()).await.unwrap();
        manager.stop_tunnel("peer-a").await;
        assert_eq!(hook.started.load(Ordering::SeqCst), 1);
        assert_eq!(hook.stopped.load(Ordering::SeqCst), 1);
    }
}
