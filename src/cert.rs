use anyhow::{anyhow, Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fs;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

const CERT_FILE: &str = "proxy.crt";
const KEY_FILE: &str = "proxy.key";
const VALIDITY_DAYS: i64 = 365;

fn tls_versions() -> &'static [&'static rustls::SupportedProtocolVersion] {
    // TLS 1.2 minimum.
    static VERSIONS: &[&rustls::SupportedProtocolVersion] =
        &[&rustls::version::TLS12, &rustls::version::TLS13];
    VERSIONS
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Generates and persists the self-signed certificate pair used by the TLS
/// tunnels. No in-memory cache: the files are re-checked on every call, and
/// an expired pair is regenerated in place.
pub struct CertManager {
    dir: PathBuf,
}

impl CertManager {
    pub fn new(dir: Option<PathBuf>) -> Self {
        let dir = dir.unwrap_or_else(default_cert_dir);
        Self { dir }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Returns the persisted pair, generating a fresh one when missing or
    /// past its NotAfter date.
    pub fn ensure_server_cert(&self, host: &str) -> Result<(PathBuf, PathBuf)> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();
        if cert_path.is_file() && key_path.is_file() {
            match cert_is_expired(&cert_path) {
                Ok(false) => return Ok((cert_path, key_path)),
                Ok(true) => {
                    warn!(path = %cert_path.display(), "certificate expired, regenerating");
                }
                Err(err) => {
                    warn!(path = %cert_path.display(), error = %err, "unreadable certificate, regenerating");
                }
            }
        }
        let not_after = OffsetDateTime::now_utc() + Duration::days(VALIDITY_DAYS);
        self.write_cert_pair(host, not_after)?;
        info!(host, path = %cert_path.display(), "generated self-signed certificate");
        Ok((cert_path, key_path))
    }

    pub fn server_tls_config(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        let (cert_path, key_path) = self.ensure_server_cert(host)?;
        self.load_tls_config(&cert_path, &key_path)
    }

    /// Builds a server config from an explicit file pair, for
    /// operator-provided certificates.
    pub fn load_tls_config(&self, cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(tls_versions())
            .context("unsupported tls versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid certificate pair")?;
        Ok(Arc::new(config))
    }

    /// `skip_verify` accepts any server certificate; self-signed tunnel
    /// endpoints are authenticated by the WireGuard layer underneath.
    pub fn client_tls_config(&self, skip_verify: bool) -> Result<Arc<rustls::ClientConfig>> {
        let provider = provider();
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(tls_versions())
            .context("unsupported tls versions")?;
        let config = if skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        Ok(Arc::new(config))
    }

    /// Removes the certificate directory and everything in it.
    pub fn cleanup(&self) -> Result<()> {
        if self.dir.is_dir() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("failed to remove {}", self.dir.display()))?;
        }
        Ok(())
    }

    fn write_cert_pair(&self, host: &str, not_after: OffsetDateTime) -> Result<()> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "wgmesh");
        params.distinguished_name = dn;
        let mut sans = vec![
            SanType::DnsName(
                "localhost"
                    .try_into()
                    .map_err(|_| anyhow!("invalid hostname"))?,
            ),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        if host != "localhost" {
            if let Ok(ip) = host.parse::<IpAddr>() {
                sans.push(SanType::IpAddress(ip));
            } else {
                sans.push(SanType::DnsName(
                    host.try_into()
                        .map_err(|_| anyhow!("invalid hostname {host:?}"))?,
                ));
            }
        }
        params.subject_alt_names = sans;
        params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
        params.not_after = not_after;
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

        let key_pair = KeyPair::generate().context("failed to generate key pair")?;
        let cert = params
            .self_signed(&key_pair)
            .context("failed to self-sign certificate")?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        fs::write(self.cert_path(), cert.pem()).context("failed to write certificate")?;
        fs::write(self.key_path(), key_pair.serialize_pem()).context("failed to write key")?;
        Ok(())
    }
}

fn default_cert_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("wgmesh-agent").join("proxy-certs"))
        .unwrap_or_else(|| std::env::temp_dir().join("wgmesh-proxy-certs"))
}

fn cert_is_expired(cert_path: &Path) -> Result<bool> {
    let data = fs::read(cert_path)
        .with_context(|| format!("failed to read {}", cert_path.display()))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data).context("invalid certificate pem")?;
    let cert = pem.parse_x509().context("invalid certificate")?;
    let not_after = cert.validity().not_after.timestamp();
    Ok(OffsetDateTime::now_utc().unix_timestamp() >= not_after)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("invalid certificate file {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("invalid key file {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{Proxy, ProxyConfig, RelayMode, TlsSettings};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    fn temp_manager(tag: &str) -> CertManager {
        let dir = std::env::temp_dir().join(format!("wgmesh-cert-test-{tag}-{}", rand::random::<u32>()));
        CertManager::new(Some(dir))
    }

    #[test]
    fn generated_pair_is_reused() {
        let manager = temp_manager("reuse");
        let (cert_path, _) = manager.ensure_server_cert("localhost").unwrap();
        let first = fs::read(&cert_path).unwrap();
        manager.ensure_server_cert("localhost").unwrap();
        let second = fs::read(&cert_path).unwrap();
        assert_eq!(first, second);
        manager.cleanup().unwrap();
    }

    #[test]
    fn expired_pair_is_regenerated() {
        let manager = temp_manager("expired");
        manager
            .write_cert_pair("localhost", OffsetDateTime::now_utc() - Duration::days(1))
            .unwrap();
        let stale = fs::read(manager.cert_path()).unwrap();
        assert!(cert_is_expired(&manager.cert_path()).unwrap());
        manager.ensure_server_cert("localhost").unwrap();
        let fresh = fs::read(manager.cert_path()).unwrap();
        assert_ne!(stale, fresh);
        assert!(!cert_is_expired(&manager.cert_path()).unwrap());
        manager.cleanup().unwrap();
    }

    #[test]
    fn load_fails_on_missing_files() {
        let manager = temp_manager("missing");
        let err = manager
            .load_tls_config(Path::new("/nonexistent/proxy.crt"), Path::new("/nonexistent/proxy.key"))
            .unwrap_err();
        assert!(err.to_string().contains("failed to open"));
    }

    #[tokio::test]
    async fn skip_verify_client_reaches_self_signed_proxy() {
        let manager = temp_manager("interop");
        let server = manager.server_tls_config("localhost").unwrap();
        let client = manager.client_tls_config(true).unwrap();

        // TLS echo endpoint standing in for the remote tunnel peer.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(server.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(stream).await {
                        let (mut read, mut write) = tokio::io::split(&mut tls);
                        let _ = tokio::io::copy(&mut read, &mut write).await;
                    }
                });
            }
        });

        let proxy = Proxy::new(ProxyConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: echo_addr.to_string(),
            tls: Some(TlsSettings {
                server,
                client: client.clone(),
            }),
            timeout: std::time::Duration::from_secs(5),
            idle_timeout: std::time::Duration::from_secs(5),
            mode: RelayMode::Stream,
        });
        let local = proxy.start().await.unwrap();

        let connector = TlsConnector::from(client);
        let stream = TcpStream::connect(local).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(name, stream).await.unwrap();
        tls.write_all(b"over tls end to end").await.unwrap();
        let mut buf = [0u8; 19];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tls end to end");

        proxy.stop().await;
        manager.cleanup().unwrap();
    }
}
