use crate::proxy::{Proxy, ProxyConfig, RelayMode, TlsSettings, DEFAULT_BUFFER_SIZE};
use crate::wg::{bind_ip, WgInterface};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const FIREWALL_BYPASS_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunnel settings layered on the proxy engine: where to listen relative to
/// the WireGuard interface and whether WireGuard's UDP datagrams ride the
/// TCP leg length-framed.
#[derive(Clone)]
pub struct WgTunnelConfig {
    pub local_port: u16,
    pub remote_addr: String,
    pub use_tls: bool,
    pub tls: Option<TlsSettings>,
    pub timeout: Duration,
    pub bind_to_wg: bool,
    pub udp_over_tcp: bool,
    pub buffer_size: usize,
}

impl WgTunnelConfig {
    pub fn new(local_port: u16, remote_addr: impl Into<String>) -> Self {
        Self {
            local_port,
            remote_addr: remote_addr.into(),
            use_tls: false,
            tls: None,
            timeout: DEFAULT_TIMEOUT,
            bind_to_wg: false,
            udp_over_tcp: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Preset for carrying WireGuard through TCP-only networks: bound to the
    /// interface, UDP-over-TCP framing, a longer dial timeout.
    pub fn firewall_bypass(local_port: u16, remote_addr: impl Into<String>, use_tls: bool) -> Self {
        Self {
            local_port,
            remote_addr: remote_addr.into(),
            use_tls,
            tls: None,
            timeout: FIREWALL_BYPASS_TIMEOUT,
            bind_to_wg: true,
            udp_over_tcp: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TunnelInfo {
    pub interface: String,
    pub mtu: u32,
    pub interface_addresses: Vec<IpAddr>,
    pub local_port: u16,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: String,
    pub use_tls: bool,
    pub udp_over_tcp: bool,
    pub bind_to_wg: bool,
    pub active: bool,
    pub connections: usize,
}

/// One proxied tunnel tied to a WireGuard interface.
pub struct WgTunnel {
    config: WgTunnelConfig,
    iface: Arc<dyn WgInterface>,
    proxy: Mutex<Option<Arc<Proxy>>>,
}

impl WgTunnel {
    pub fn new(config: WgTunnelConfig, iface: Arc<dyn WgInterface>) -> Self {
        Self {
            config,
            iface,
            proxy: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WgTunnelConfig {
        &self.config
    }

    /// Resolves the listen address against the interface, builds the inner
    /// proxy and starts it. Binding to an interface without addresses is a
    /// hard error, as is requesting TLS without certificate material.
    pub async fn start(&self) -> Result<SocketAddr> {
        let existing = self.proxy.lock().unwrap().clone();
        if let Some(proxy) = existing {
            return proxy.start().await;
        }

        if self.config.use_tls && self.config.tls.is_none() {
            return Err(anyhow!("tls requested without certificate material"));
        }
        let local_addr = self.resolve_bind_addr()?;
        let mode = if self.config.udp_over_tcp {
            RelayMode::Framed {
                buffer_size: self.config.buffer_size,
            }
        } else {
            RelayMode::Stream
        };
        let proxy = Arc::new(Proxy::new(ProxyConfig {
            local_addr,
            remote_addr: self.config.remote_addr.clone(),
            tls: if self.config.use_tls {
                self.config.tls.clone()
            } else {
                None
            },
            timeout: self.config.timeout,
            idle_timeout: Duration::ZERO,
            mode,
        }));
        let addr = proxy.start().await?;
        info!(
            interface = self.iface.name(),
            local = %addr,
            remote = %self.config.remote_addr,
            udp_over_tcp = self.config.udp_over_tcp,
            "tunnel started"
        );
        *self.proxy.lock().unwrap() = Some(proxy);
        Ok(addr)
    }

    pub async fn stop(&self) {
        let proxy = self.proxy.lock().unwrap().take();
        if let Some(proxy) = proxy {
            proxy.stop().await;
            info!(interface = self.iface.name(), "tunnel stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.proxy
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|proxy| proxy.local_addr())
    }

    pub fn active_connections(&self) -> usize {
        self.proxy
            .lock()
            .unwrap()
            .as_ref()
            .map(|proxy| proxy.active_connections())
            .unwrap_or(0)
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            interface: self.iface.name().to_string(),
            mtu: self.iface.mtu(),
            interface_addresses: self.iface.addresses(),
            local_port: self.config.local_port,
            local_addr: self.local_addr(),
            remote_addr: self.config.remote_addr.clone(),
            use_tls: self.config.use_tls,
            udp_over_tcp: self.config.udp_over_tcp,
            bind_to_wg: self.config.bind_to_wg,
            active: self.local_addr().is_some(),
            connections: self.active_connections(),
        }
    }

    fn resolve_bind_addr(&self) -> Result<SocketAddr> {
        if !self.config.bind_to_wg {
            return Ok(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.config.local_port,
            ));
        }
        let addresses = self.iface.addresses();
        let ip = bind_ip(&addresses)
            .ok_or_else(|| anyhow!("interface {} has no addresses to bind", self.iface.name()))?;
        Ok(SocketAddr::new(ip, self.config.local_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wg::StaticWgIface;

    fn loopback_iface() -> Arc<dyn WgInterface> {
        Arc::new(StaticWgIface::new(
            "wg0",
            1420,
            vec!["127.0.0.1".parse().unwrap()],
        ))
    }

    #[tokio::test]
    async fn binds_to_interface_address() {
        let mut config = WgTunnelConfig::new(0, "127.0.0.1:51820");
        config.bind_to_wg = true;
        let tunnel = WgTunnel::new(config, loopback_iface());
        let addr = tunnel.start().await.unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(tunnel.info().active);
        tunnel.stop().await;
        assert!(!tunnel.info().active);
    }

    #[tokio::test]
    async fn refuses_interface_without_addresses() {
        let mut config = WgTunnelConfig::new(0, "127.0.0.1:51820");
        config.bind_to_wg = true;
        let iface: Arc<dyn WgInterface> = Arc::new(StaticWgIface::new("wg0", 1420, vec![]));
        let tunnel = WgTunnel::new(config, iface);
        assert!(tunnel.start().await.is_err());
    }

    #[tokio::test]
    async fn refuses_tls_without_material() {
        let mut config = WgTunnelConfig::new(0, "127.0.0.1:51820");
        config.use_tls = true;
        let tunnel = WgTunnel::new(config, loopback_iface());
        assert!(tunnel.start().await.is_err());
    }

    #[test]
    fn firewall_bypass_preset() {
        let config = WgTunnelConfig::firewall_bypass(51821, "10.0.0.2:443", true);
        assert!(config.bind_to_wg);
        assert!(config.udp_over_tcp);
        assert!(config.use_tls);
        assert_eq!(config.timeout, FIREWALL_BYPASS_TIMEOUT);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }
}
