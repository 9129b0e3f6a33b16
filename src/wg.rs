use std::net::IpAddr;

/// Read-only view of the WireGuard interface this agent fronts. The
/// interface itself is configured elsewhere; tunnels only consult it for
/// the address to bind to.
pub trait WgInterface: Send + Sync {
    fn name(&self) -> &str;
    fn mtu(&self) -> u32;
    fn addresses(&self) -> Vec<IpAddr>;
}

/// Interface snapshot supplied by configuration or the CLI.
pub struct StaticWgIface {
    name: String,
    mtu: u32,
    addresses: Vec<IpAddr>,
}

impl StaticWgIface {
    pub fn new(name: impl Into<String>, mtu: u32, addresses: Vec<IpAddr>) -> Self {
        Self {
            name: name.into(),
            mtu,
            addresses,
        }
    }
}

impl WgInterface for StaticWgIface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn addresses(&self) -> Vec<IpAddr> {
        self.addresses.clone()
    }
}

/// Picks the address a tunnel should bind to: the first IPv4 address if one
/// is configured, otherwise the first address of any family.
pub fn bind_ip(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ip_prefers_ipv4() {
        let addrs: Vec<IpAddr> = vec![
            "fd00::1".parse().unwrap(),
            "10.10.0.2".parse().unwrap(),
        ];
        assert_eq!(bind_ip(&addrs), Some("10.10.0.2".parse().unwrap()));
    }

    #[test]
    fn bind_ip_falls_back_to_first_address() {
        let addrs: Vec<IpAddr> = vec!["fd00::1".parse().unwrap()];
        assert_eq!(bind_ip(&addrs), Some("fd00::1".parse().unwrap()));
        assert_eq!(bind_ip(&[]), None);
    }
}
