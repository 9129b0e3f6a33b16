use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

const MAGIC_COOKIE: u32 = 0x2112A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StunServer {
    pub domain: String,
    pub port: u16,
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}

pub fn default_stun_servers() -> Vec<StunServer> {
    ["stun1", "stun2", "stun3", "stun4"]
        .iter()
        .map(|name| StunServer {
            domain: format!("{}.l.google.com", name),
            port: 19302,
        })
        .collect()
}

/// Parses a `host:port,host:port` override list. Entries that do not parse
/// are skipped; an empty result falls back to the default server list.
pub fn parse_server_list(list: &str) -> Vec<StunServer> {
    let mut servers = Vec::new();
    for entry in list.split(',') {
        let Some((domain, port)) = entry.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.trim().parse::<u16>() else {
            continue;
        };
        let domain = domain.trim();
        if domain.is_empty() {
            continue;
        }
        servers.push(StunServer {
            domain: domain.to_string(),
            port,
        });
    }
    if servers.is_empty() {
        return default_stun_servers();
    }
    servers
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    Public,
    BehindNat,
}

impl fmt::Display for NatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatKind::Public => write!(f, "public"),
            NatKind::BehindNat => write!(f, "behind-nat"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Endpoint {
    pub public_ip: IpAddr,
    pub public_port: u16,
    pub nat: NatKind,
}

/// Probes the externally visible endpoint for the given local UDP port.
///
/// Servers are tried in order; the first completed Binding transaction wins.
/// Per-server failures are logged and the next server is tried. `None` means
/// every server failed and the public endpoint is unknown.
///
/// This blocks the calling thread for up to `timeout` per server; run it
/// during interface bring-up or a health check, never on a hot path.
pub fn hole_punch(
    servers: &[StunServer],
    port: u16,
    family: IpFamily,
    timeout: Duration,
) -> Option<Endpoint> {
    for server in servers {
        match probe_server(server, port, family, timeout) {
            Ok(endpoint) => {
                debug!(
                    server = %server,
                    public_ip = %endpoint.public_ip,
                    public_port = endpoint.public_port,
                    nat = %endpoint.nat,
                    "hole punching complete"
                );
                return Some(endpoint);
            }
            Err(err) => {
                warn!(server = %server, error = %err, "stun probe failed");
            }
        }
    }
    None
}

pub fn classify(local_ip: IpAddr, public_ip: IpAddr) -> NatKind {
    if local_ip == public_ip {
        NatKind::Public
    } else {
        NatKind::BehindNat
    }
}

fn probe_server(
    server: &StunServer,
    port: u16,
    family: IpFamily,
    timeout: Duration,
) -> Result<Endpoint> {
    let server_addr = resolve_server(server, family)?;
    let bind_addr = match family {
        IpFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpFamily::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    };

    let socket = UdpSocket::bind(bind_addr).context("failed to bind stun socket")?;
    socket
        .set_read_timeout(Some(timeout))
        .context("failed to set stun timeout")?;
    // Connecting pins the source address the OS picked for this server,
    // which is what the NAT classification compares against.
    socket
        .connect(server_addr)
        .context("failed to connect stun socket")?;
    let local_ip = socket.local_addr()?.ip();

    let (transaction_id, request) = build_binding_request();
    socket.send(&request).context("failed to send stun request")?;

    let mut buf = [0u8; 1024];
    let len = socket.recv(&mut buf).context("stun recv failed")?;
    let mapped = parse_binding_response(&buf[..len], &transaction_id)?;

    Ok(Endpoint {
        public_ip: mapped.ip(),
        public_port: mapped.port(),
        nat: classify(local_ip, mapped.ip()),
    })
}

fn resolve_server(server: &StunServer, family: IpFamily) -> Result<SocketAddr> {
    let addrs = (server.domain.as_str(), server.port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve stun server {}", server))?;
    addrs
        .into_iter()
        .find(|addr| match family {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        })
        .ok_or_else(|| anyhow!("stun server {} has no address for the requested family", server))
}

fn build_binding_request() -> ([u8; 12], [u8; 20]) {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    let mut buf = [0u8; 20];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf[2..4].copy_from_slice(&0u16.to_be_bytes());
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(&transaction_id);
    (transaction_id, buf)
}

fn parse_binding_response(buf: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if buf.len() < 20 {
        return Err(anyhow!("stun response too short"));
    }

    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(anyhow!("unexpected stun response type {:04x}", msg_type));
    }

    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 20 + msg_len {
        return Err(anyhow!("stun response length mismatch"));
    }

    if buf[4..8] != MAGIC_COOKIE.to_be_bytes() {
        return Err(anyhow!("stun response missing magic cookie"));
    }

    if buf[8..20] != transaction_id[..] {
        return Err(anyhow!("stun transaction id mismatch"));
    }

    let mut offset = 20;
    let end = 20 + msg_len;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > end {
            break;
        }
        let attr = &buf[offset..offset + attr_len];
        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            if let Some(addr) = parse_xor_mapped(attr, transaction_id) {
                return Ok(addr);
            }
        } else if attr_type == ATTR_MAPPED_ADDRESS {
            if let Some(addr) = parse_mapped(attr) {
                return Ok(addr);
            }
        }
        offset += (attr_len + 3) & !3;
    }

    Err(anyhow!("stun response missing mapped address"))
}

fn parse_mapped(attr: &[u8]) -> Option<SocketAddr> {
    if attr.len() < 4 {
        return None;
    }
    let family = attr[1];
    let port = u16::from_be_bytes([attr[2], attr[3]]);
    match family {
        0x01 => {
            if attr.len() < 8 {
                return None;
            }
            let addr = Ipv4Addr::new(attr[4], attr[5], attr[6], attr[7]);
            Some(SocketAddr::new(IpAddr::V4(addr), port))
        }
        0x02 => {
            if attr.len() < 20 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&attr[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn parse_xor_mapped(attr: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if attr.len() < 4 {
        return None;
    }
    let family = attr[1];
    let port = u16::from_be_bytes([attr[2], attr[3]]) ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        0x01 => {
            if attr.len() < 8 {
                return None;
            }
            let xaddr = u32::from_be_bytes([attr[4], attr[5], attr[6], attr[7]]) ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(xaddr)), port))
        }
        0x02 => {
            if attr.len() < 20 {
                return None;
            }
            let mut xor = [0u8; 16];
            xor[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor[4..16].copy_from_slice(transaction_id);
            let mut addr = [0u8; 16];
            for i in 0..16 {
                addr[i] = attr[4 + i] ^ xor[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_success(transaction_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let mut attr = Vec::new();
        match addr {
            SocketAddr::V4(v4) => {
                attr.push(0);
                attr.push(0x01);
                attr.extend_from_slice(&(v4.port() ^ ((MAGIC_COOKIE >> 16) as u16)).to_be_bytes());
                let xip = u32::from(*v4.ip()) ^ MAGIC_COOKIE;
                attr.extend_from_slice(&xip.to_be_bytes());
            }
            SocketAddr::V6(_) => unreachable!("v4 only in this helper"),
        }
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&((attr.len() as u16 + 4).to_be_bytes()));
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(transaction_id);
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        msg.extend_from_slice(&attr);
        msg
    }

    #[test]
    fn binding_request_has_cookie_and_id() {
        let (id, request) = build_binding_request();
        assert_eq!(&request[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &id);
    }

    #[test]
    fn parses_xor_mapped_address() {
        let id = [7u8; 12];
        let addr: SocketAddr = "203.0.113.9:4242".parse().unwrap();
        let msg = binding_success(&id, addr);
        assert_eq!(parse_binding_response(&msg, &id).unwrap(), addr);
    }

    #[test]
    fn rejects_transaction_id_mismatch() {
        let id = [7u8; 12];
        let addr: SocketAddr = "203.0.113.9:4242".parse().unwrap();
        let msg = binding_success(&id, addr);
        let other = [8u8; 12];
        assert!(parse_binding_response(&msg, &other).is_err());
    }

    #[test]
    fn classification_tracks_address_equality() {
        let public: IpAddr = "192.0.2.10".parse().unwrap();
        assert_eq!(classify(public, public), NatKind::Public);
        let local: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(classify(local, public), NatKind::BehindNat);
    }

    #[test]
    fn server_list_parsing_skips_invalid_entries() {
        let servers = parse_server_list("stun.example.org:3478,junk,other:abc");
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].domain, "stun.example.org");
        assert_eq!(servers[0].port, 3478);
        // Nothing usable falls back to the defaults.
        assert_eq!(parse_server_list("junk").len(), 4);
    }
}
