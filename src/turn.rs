use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use md5::{Digest as Md5Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

type HmacSha1 = Hmac<Sha1>;

const MAGIC_COOKIE: u32 = 0x2112A442;
const MSG_ALLOCATE_REQUEST: u16 = 0x0003;
const MSG_ALLOCATE_SUCCESS: u16 = 0x0103;
const MSG_ALLOCATE_ERROR: u16 = 0x0113;
const MSG_REFRESH_REQUEST: u16 = 0x0004;
const MSG_REFRESH_SUCCESS: u16 = 0x0104;
const MSG_REFRESH_ERROR: u16 = 0x0114;
const MSG_CREATE_PERMISSION_REQUEST: u16 = 0x0008;
const MSG_CREATE_PERMISSION_SUCCESS: u16 = 0x0108;
const MSG_SEND_INDICATION: u16 = 0x0016;
const MSG_DATA_INDICATION: u16 = 0x0017;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
const ATTR_DATA: u16 = 0x0013;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const ERROR_UNAUTHORIZED: u16 = 401;
const ERROR_STALE_NONCE: u16 = 438;
const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);
const BCRYPT_COST: u32 = 5;

#[derive(Clone, Debug)]
pub struct RelayCredentials {
    pub username: String,
    pub password: String,
}

impl RelayCredentials {
    /// Derives the long-term credentials the relay expects from the host's
    /// stable identity: the host id as username, a bcrypt hash of the shared
    /// secret as password.
    pub fn for_host(host_id: &str, shared_secret: &str) -> Result<Self> {
        let hash =
            bcrypt::hash(shared_secret, BCRYPT_COST).context("failed to hash relay secret")?;
        Ok(Self {
            username: host_id.to_string(),
            password: hash,
        })
    }
}

struct AuthState {
    username: String,
    realm: String,
    nonce: String,
    key: Vec<u8>,
}

/// One allocation on a TURN relay, held for as long as this client lives.
///
/// Allocation failures surface as errors so relay unavailability degrades to
/// "no relay available" instead of terminating the agent. The allocation is
/// kept alive by [`RelayClient::spawn_keepalive`] and released by
/// [`RelayClient::close`].
pub struct RelayClient {
    socket: UdpSocket,
    server: SocketAddr,
    relay_addr: SocketAddr,
    mapped_addr: Option<SocketAddr>,
    timeout: Duration,
    lifetime: Mutex<Duration>,
    auth: Mutex<Option<AuthState>>,
    shutdown: watch::Sender<bool>,
}

impl RelayClient {
    /// Binds an ephemeral UDP socket and performs the Allocate transaction,
    /// retrying once with long-term credentials on a 401 or 438 challenge.
    pub async fn allocate(
        server: &str,
        creds: Option<&RelayCredentials>,
        timeout_duration: Duration,
    ) -> Result<RelayClient> {
        allocate_inner(server, creds, timeout_duration).await
    }
}

async fn allocate_inner(
    server: &str,
    creds: Option<&RelayCredentials>,
    timeout_duration: Duration,
) -> Result<RelayClient> {
    let server_addr = resolve_server(server)?;
    let bind_addr = match server_addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind turn socket")?;

    let (transaction_id, request) = build_allocate_request(None, None, None);
    socket.send_to(&request, server_addr).await?;
    let response = recv_message(&socket, server_addr, timeout_duration).await?;
    let parsed = parse_message(&response, Some(&transaction_id))?;

    match parsed.msg_type {
        MSG_ALLOCATE_SUCCESS => {
            let (relay_addr, mapped_addr) = extract_addresses(&parsed, &transaction_id)?;
            let lifetime = extract_lifetime(&parsed).unwrap_or(DEFAULT_LIFETIME);
            info!(server = %server_addr, relay = %relay_addr, "turn allocation granted");
            return Ok(RelayClient {
                socket,
                server: server_addr,
                relay_addr,
                mapped_addr,
                timeout: timeout_duration,
                lifetime: Mutex::new(lifetime),
                auth: Mutex::new(None),
                shutdown: watch::channel(false).0,
            });
        }
        MSG_ALLOCATE_ERROR => {
            let error_code = extract_error_code(&parsed);
            if error_code == Some(ERROR_UNAUTHORIZED) || error_code == Some(ERROR_STALE_NONCE) {
                let creds = creds.ok_or_else(|| anyhow!("turn auth required"))?;
                let realm = extract_string(&parsed, ATTR_REALM)
                    .ok_or_else(|| anyhow!("turn realm missing"))?;
                let nonce = extract_string(&parsed, ATTR_NONCE)
                    .ok_or_else(|| anyhow!("turn nonce missing"))?;
                let key = build_long_term_key(creds, &realm);
                let (transaction_id, request) = build_allocate_request(
                    Some(creds.username.as_str()),
                    Some(realm.as_str()),
                    Some(nonce.as_str()),
                );
                let request = add_message_integrity(request, &key)?;
                socket.send_to(&request, server_addr).await?;
                let response = recv_message(&socket, server_addr, timeout_duration).await?;
                let parsed = parse_message(&response, Some(&transaction_id))?;
                if parsed.msg_type != MSG_ALLOCATE_SUCCESS {
                    return Err(anyhow!(
                        "turn allocate failed after auth (error {:?})",
                        extract_error_code(&parsed)
                    ));
                }
                let (relay_addr, mapped_addr) = extract_addresses(&parsed, &transaction_id)?;
                let lifetime = extract_lifetime(&parsed).unwrap_or(DEFAULT_LIFETIME);
                info!(server = %server_addr, relay = %relay_addr, "turn allocation granted");
                return Ok(RelayClient {
                    socket,
                    server: server_addr,
                    relay_addr,
                    mapped_addr,
                    timeout: timeout_duration,
                    lifetime: Mutex::new(lifetime),
                    auth: Mutex::new(Some(AuthState {
                        username: creds.username.clone(),
                        realm,
                        nonce,
                        key,
                    })),
                    shutdown: watch::channel(false).0,
                });
            }
            return Err(anyhow!("turn allocate rejected (error {:?})", error_code));
        }
        _ => {}
    }

    Err(anyhow!("turn allocate failed"))
}

impl RelayClient {
    /// The transport address allocated on the relay; peers send here.
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// The server-reflexive address observed by the relay, when present.
    pub fn mapped_addr(&self) -> Option<SocketAddr> {
        self.mapped_addr
    }

    /// Refreshes the allocation at half its granted lifetime until
    /// [`RelayClient::close`] is called.
    pub fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = client.shutdown.subscribe();
            loop {
                let interval = {
                    let lifetime = *client.lifetime.lock().unwrap();
                    (lifetime / 2).max(Duration::from_secs(30))
                };
                tokio::select! {
                    _ = sleep(interval) => {
                        if let Err(err) = client.refresh().await {
                            warn!(error = %err, "turn refresh failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    /// Extends the allocation; a stale-nonce rejection refreshes the nonce
    /// and retries once.
    pub async fn refresh(&self) -> Result<()> {
        let requested = *self.lifetime.lock().unwrap();
        match self.refresh_once(requested).await? {
            RefreshOutcome::Granted(lifetime) => {
                *self.lifetime.lock().unwrap() = lifetime;
                debug!(lifetime_secs = lifetime.as_secs(), "turn allocation refreshed");
                Ok(())
            }
            RefreshOutcome::StaleNonce => match self.refresh_once(requested).await? {
                RefreshOutcome::Granted(lifetime) => {
                    *self.lifetime.lock().unwrap() = lifetime;
                    Ok(())
                }
                RefreshOutcome::StaleNonce => Err(anyhow!("turn nonce stale after retry")),
            },
        }
    }

    /// Signals the keepalive task to stop without touching the allocation;
    /// it then lapses at the server when the lifetime runs out.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Shuts the keepalive down and releases the allocation with a
    /// zero-lifetime refresh, best effort.
    pub async fn close(&self) {
        self.shutdown();
        if let Err(err) = self.refresh_once(Duration::ZERO).await {
            debug!(error = %err, "turn deallocation failed");
        }
    }

    pub async fn create_permission(&self, peer: SocketAddr) -> Result<()> {
        let transaction_id = random_transaction_id();
        let mut attrs = vec![Attribute::new(
            ATTR_XOR_PEER_ADDRESS,
            encode_xor_address(peer, &transaction_id),
        )];
        attrs.extend(self.auth_attributes());
        let request = build_message(MSG_CREATE_PERMISSION_REQUEST, &transaction_id, attrs);
        let request = self.maybe_add_integrity(request)?;
        self.socket.send_to(&request, self.server).await?;
        let response = recv_message(&self.socket, self.server, self.timeout).await?;
        let parsed = parse_message(&response, Some(&transaction_id))?;
        if parsed.msg_type == MSG_CREATE_PERMISSION_SUCCESS {
            return Ok(());
        }
        Err(anyhow!(
            "turn create permission failed (error {:?})",
            extract_error_code(&parsed)
        ))
    }

    pub async fn send_data(&self, peer: SocketAddr, data: &[u8]) -> Result<()> {
        let transaction_id = random_transaction_id();
        let attrs = vec![
            Attribute::new(ATTR_XOR_PEER_ADDRESS, encode_xor_address(peer, &transaction_id)),
            Attribute::new(ATTR_DATA, data.to_vec()),
        ];
        let request = build_message(MSG_SEND_INDICATION, &transaction_id, attrs);
        self.socket.send_to(&request, self.server).await?;
        Ok(())
    }

    /// Receives one Data indication. Non-data traffic from the server and
    /// packets from other sources yield `Ok(None)`.
    pub async fn recv_data(
        &self,
        timeout_duration: Option<Duration>,
    ) -> Result<Option<(SocketAddr, Vec<u8>)>> {
        let mut buf = vec![0u8; 2048];
        let result = if let Some(timeout_duration) = timeout_duration {
            timeout(timeout_duration, self.socket.recv_from(&mut buf)).await?
        } else {
            self.socket.recv_from(&mut buf).await
        };

        let (len, from) = result?;
        if from != self.server {
            return Ok(None);
        }
        let parsed = parse_message(&buf[..len], None)?;
        if parsed.msg_type != MSG_DATA_INDICATION {
            return Ok(None);
        }
        let transaction_id = parsed.transaction_id;
        let peer = extract_xor_address(&parsed, ATTR_XOR_PEER_ADDRESS, &transaction_id)
            .ok_or_else(|| anyhow!("turn data indication missing peer address"))?;
        let data = extract_bytes(&parsed, ATTR_DATA).unwrap_or_default();
        Ok(Some((peer, data)))
    }

    async fn refresh_once(&self, requested: Duration) -> Result<RefreshOutcome> {
        let transaction_id = random_transaction_id();
        let mut attrs = vec![Attribute::new(
            ATTR_LIFETIME,
            (requested.as_secs() as u32).to_be_bytes().to_vec(),
        )];
        attrs.extend(self.auth_attributes());
        let request = build_message(MSG_REFRESH_REQUEST, &transaction_id, attrs);
        let request = self.maybe_add_integrity(request)?;
        self.socket.send_to(&request, self.server).await?;
        let response = recv_message(&self.socket, self.server, self.timeout).await?;
        let parsed = parse_message(&response, Some(&transaction_id))?;
        match parsed.msg_type {
            MSG_REFRESH_SUCCESS => Ok(RefreshOutcome::Granted(
                extract_lifetime(&parsed).unwrap_or(requested),
            )),
            MSG_REFRESH_ERROR if extract_error_code(&parsed) == Some(ERROR_STALE_NONCE) => {
                let nonce = extract_string(&parsed, ATTR_NONCE)
                    .ok_or_else(|| anyhow!("turn stale nonce response missing nonce"))?;
                if let Some(auth) = self.auth.lock().unwrap().as_mut() {
                    auth.nonce = nonce;
                }
                Ok(RefreshOutcome::StaleNonce)
            }
            _ => Err(anyhow!(
                "turn refresh failed (error {:?})",
                extract_error_code(&parsed)
            )),
        }
    }

    fn auth_attributes(&self) -> Vec<Attribute> {
        let auth = self.auth.lock().unwrap();
        let Some(auth) = auth.as_ref() else {
            return Vec::new();
        };
        vec![
            Attribute::new(ATTR_USERNAME, auth.username.as_bytes().to_vec()),
            Attribute::new(ATTR_REALM, auth.realm.as_bytes().to_vec()),
            Attribute::new(ATTR_NONCE, auth.nonce.as_bytes().to_vec()),
        ]
    }

    fn maybe_add_integrity(&self, msg: Vec<u8>) -> Result<Vec<u8>> {
        let auth = self.auth.lock().unwrap();
        if let Some(auth) = auth.as_ref() {
            add_message_integrity(msg, &auth.key)
        } else {
            Ok(msg)
        }
    }
}

enum RefreshOutcome {
    Granted(Duration),
    StaleNonce,
}

fn resolve_server(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .context("failed to resolve turn server")?
        .next()
        .ok_or_else(|| anyhow!("turn server resolution returned no addresses"))
}

fn random_transaction_id() -> [u8; 12] {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

fn build_allocate_request(
    username: Option<&str>,
    realm: Option<&str>,
    nonce: Option<&str>,
) -> ([u8; 12], Vec<u8>) {
    let transaction_id = random_transaction_id();
    let mut attrs = Vec::new();
    // Requested transport 17 = UDP.
    attrs.push(Attribute::new(ATTR_REQUESTED_TRANSPORT, vec![17, 0, 0, 0]));
    if let Some(username) = username {
        attrs.push(Attribute::new(ATTR_USERNAME, username.as_bytes().to_vec()));
    }
    if let Some(realm) = realm {
        attrs.push(Attribute::new(ATTR_REALM, realm.as_bytes().to_vec()));
    }
    if let Some(nonce) = nonce {
        attrs.push(Attribute::new(ATTR_NONCE, nonce.as_bytes().to_vec()));
    }
    let msg = build_message(MSG_ALLOCATE_REQUEST, &transaction_id, attrs);
    (transaction_id, msg)
}

fn build_message(msg_type: u16, transaction_id: &[u8; 12], attrs: Vec<Attribute>) -> Vec<u8> {
    let mut body = Vec::new();
    for attr in attrs {
        attr.write(&mut body);
    }
    let length = body.len() as u16;
    let mut buf = Vec::with_capacity(20 + body.len());
    buf.extend_from_slice(&msg_type.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf.extend_from_slice(&body);
    buf
}

fn add_message_integrity(mut msg: Vec<u8>, key: &[u8]) -> Result<Vec<u8>> {
    let current_len = u16::from_be_bytes([msg[2], msg[3]]);
    let total_len = current_len.saturating_add(24);
    msg[2..4].copy_from_slice(&total_len.to_be_bytes());
    let mi_offset = msg.len() + 4;
    msg.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
    msg.extend_from_slice(&(20u16).to_be_bytes());
    msg.extend_from_slice(&[0u8; 20]);

    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| anyhow!("invalid hmac key"))?;
    mac.update(&msg[..mi_offset - 4]);
    let result = mac.finalize().into_bytes();
    msg[mi_offset..mi_offset + 20].copy_from_slice(&result);
    Ok(msg)
}

fn build_long_term_key(creds: &RelayCredentials, realm: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", creds.username, realm, creds.password).as_bytes());
    hasher.finalize().to_vec()
}

async fn recv_message(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout_duration: Duration,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    let (len, from) = timeout(timeout_duration, socket.recv_from(&mut buf)).await??;
    if from != server {
        return Err(anyhow!("unexpected turn response source"));
    }
    buf.truncate(len);
    Ok(buf)
}

#[derive(Clone)]
struct Attribute {
    ty: u16,
    value: Vec<u8>,
}

impl Attribute {
    fn new(ty: u16, value: Vec<u8>) -> Self {
        Self { ty, value }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ty.to_be_bytes());
        buf.extend_from_slice(&(self.value.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.value);
        let padding = (4 - (self.value.len() % 4)) % 4;
        if padding > 0 {
            buf.extend_from_slice(&vec![0u8; padding]);
        }
    }
}

struct ParsedMessage {
    msg_type: u16,
    transaction_id: [u8; 12],
    attrs: Vec<Attribute>,
}

fn parse_message(buf: &[u8], expected_id: Option<&[u8; 12]>) -> Result<ParsedMessage> {
    if buf.len() < 20 {
        return Err(anyhow!("turn message too short"));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf[4..8] != MAGIC_COOKIE.to_be_bytes() {
        return Err(anyhow!("turn message missing magic cookie"));
    }
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&buf[8..20]);
    if let Some(expected) = expected_id {
        if &transaction_id != expected {
            return Err(anyhow!("turn transaction id mismatch"));
        }
    }
    if buf.len() < 20 + length {
        return Err(anyhow!("turn message length mismatch"));
    }
    let mut attrs = Vec::new();
    let mut offset = 20;
    let end = 20 + length;
    while offset + 4 <= end {
        let ty = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4;
        if offset + len > end {
            break;
        }
        let value = buf[offset..offset + len].to_vec();
        attrs.push(Attribute { ty, value });
        offset += (len + 3) & !3;
    }
    Ok(ParsedMessage {
        msg_type,
        transaction_id,
        attrs,
    })
}

fn extract_error_code(parsed: &ParsedMessage) -> Option<u16> {
    for attr in &parsed.attrs {
        if attr.ty != ATTR_ERROR_CODE || attr.value.len() < 4 {
            continue;
        }
        let class = attr.value[2] & 0x07;
        let number = attr.value[3];
        return Some((class as u16) * 100 + number as u16);
    }
    None
}

fn extract_string(parsed: &ParsedMessage, attr_type: u16) -> Option<String> {
    parsed
        .attrs
        .iter()
        .find(|attr| attr.ty == attr_type)
        .and_then(|attr| String::from_utf8(attr.value.clone()).ok())
}

fn extract_bytes(parsed: &ParsedMessage, attr_type: u16) -> Option<Vec<u8>> {
    parsed
        .attrs
        .iter()
        .find(|attr| attr.ty == attr_type)
        .map(|attr| attr.value.clone())
}

fn extract_lifetime(parsed: &ParsedMessage) -> Option<Duration> {
    parsed
        .attrs
        .iter()
        .find(|attr| attr.ty == ATTR_LIFETIME && attr.value.len() >= 4)
        .map(|attr| {
            let secs =
                u32::from_be_bytes([attr.value[0], attr.value[1], attr.value[2], attr.value[3]]);
            Duration::from_secs(secs as u64)
        })
}

fn extract_addresses(
    parsed: &ParsedMessage,
    transaction_id: &[u8; 12],
) -> Result<(SocketAddr, Option<SocketAddr>)> {
    let relay = extract_xor_address(parsed, ATTR_XOR_RELAYED_ADDRESS, transaction_id)
        .ok_or_else(|| anyhow!("turn allocate missing relay address"))?;
    let mapped = extract_xor_address(parsed, ATTR_XOR_MAPPED_ADDRESS, transaction_id);
    Ok((relay, mapped))
}

fn extract_xor_address(
    parsed: &ParsedMessage,
    attr_type: u16,
    transaction_id: &[u8; 12],
) -> Option<SocketAddr> {
    parsed
        .attrs
        .iter()
        .filter(|attr| attr.ty == attr_type)
        .find_map(|attr| decode_xor_address(&attr.value, transaction_id))
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        0x01 => {
            if value.len() < 8 {
                return None;
            }
            let xaddr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(xaddr)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return None;
            }
            let mut xor = [0u8; 16];
            xor[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor[4..16].copy_from_slice(transaction_id);
            let mut addr = [0u8; 16];
            for i in 0..16 {
                addr[i] = value[4 + i] ^ xor[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
        }
        _ => None,
    }
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut value = Vec::new();
    value.push(0);
    match addr {
        SocketAddr::V4(addr) => {
            value.push(0x01);
            let port = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
            value.extend_from_slice(&port.to_be_bytes());
            let xaddr = u32::from(*addr.ip()) ^ MAGIC_COOKIE;
            value.extend_from_slice(&xaddr.to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            value.push(0x02);
            let port = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
            value.extend_from_slice(&port.to_be_bytes());
            let mut xor = [0u8; 16];
            xor[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor[4..16].copy_from_slice(transaction_id);
            let mut ip_bytes = addr.ip().octets();
            for i in 0..16 {
                ip_bytes[i] ^= xor[i];
            }
            value.extend_from_slice(&ip_bytes);
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_credentials_use_bcrypt() {
        let creds = RelayCredentials::for_host("host-1234", "shared-secret").unwrap();
        assert_eq!(creds.username, "host-1234");
        assert!(bcrypt::verify("shared-secret", &creds.password).unwrap());
    }

    #[test]
    fn allocate_request_carries_udp_transport() {
        let (id, msg) = build_allocate_request(None, None, None);
        let parsed = parse_message(&msg, Some(&id)).unwrap();
        assert_eq!(parsed.msg_type, MSG_ALLOCATE_REQUEST);
        let transport = extract_bytes(&parsed, ATTR_REQUESTED_TRANSPORT).unwrap();
        assert_eq!(transport[0], 17);
    }

    #[test]
    fn xor_address_encoding_round_trips() {
        let id = random_transaction_id();
        for addr in ["198.51.100.7:51820", "[2001:db8::7]:51820"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let encoded = encode_xor_address(addr, &id);
            assert_eq!(decode_xor_address(&encoded, &id), Some(addr));
        }
    }

    #[test]
    fn error_code_and_lifetime_extraction() {
        let id = random_transaction_id();
        let attrs = vec![
            Attribute::new(ATTR_ERROR_CODE, vec![0, 0, 4, 38]),
            Attribute::new(ATTR_LIFETIME, 600u32.to_be_bytes().to_vec()),
        ];
        let msg = build_message(MSG_ALLOCATE_ERROR, &id, attrs);
        let parsed = parse_message(&msg, Some(&id)).unwrap();
        assert_eq!(extract_error_code(&parsed), Some(ERROR_STALE_NONCE));
        assert_eq!(extract_lifetime(&parsed), Some(Duration::from_secs(600)));
    }

    #[test]
    fn message_integrity_extends_declared_length() {
        let id = random_transaction_id();
        let msg = build_message(
            MSG_REFRESH_REQUEST,
            &id,
            vec![Attribute::new(ATTR_LIFETIME, 0u32.to_be_bytes().to_vec())],
        );
        let body_len = u16::from_be_bytes([msg[2], msg[3]]);
        let signed = add_message_integrity(msg, b"0123456789abcdef").unwrap();
        let signed_len = u16::from_be_bytes([signed[2], signed[3]]);
        assert_eq!(signed_len, body_len + 24);
        assert_eq!(&signed[signed.len() - 24..signed.len() - 22], &ATTR_MESSAGE_INTEGRITY.to_be_bytes());
    }
}
