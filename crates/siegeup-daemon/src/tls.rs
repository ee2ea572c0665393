//! TLS material for the HTTPS control surface.
//!
//! The agent serves HTTPS only. Certificate and key live as `cert.pem` and
//! `key.pem` in the base directory; when either is missing, a self-signed
//! pair is generated (CN = hostname, SAN = hostname + loopback + the host's
//! outbound IPv4 when discoverable) and written to disk before the listener
//! starts. Material already on disk is used as-is, so operators can install
//! their own.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::stats;

/// Certificate file name under the base directory.
pub const CERT_FILE: &str = "cert.pem";

/// Private-key file name under the base directory.
pub const KEY_FILE: &str = "key.pem";

/// Loads the rustls configuration for the listener, generating a self-signed
/// pair first when none exists on disk.
///
/// # Errors
///
/// Returns an error when generation fails or the PEM files are unreadable.
pub async fn load_or_create(base: &Path) -> anyhow::Result<RustlsConfig> {
    let cert_path = base.join(CERT_FILE);
    let key_path = base.join(KEY_FILE);
    if !cert_path.exists() || !key_path.exists() {
        generate_self_signed(&cert_path, &key_path)?;
    }
    RustlsConfig::from_pem_file(&cert_path, &key_path)
        .await
        .context("failed to load TLS certificate material")
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    let host = stats::hostname();
    let mut sans = vec![host.clone(), "127.0.0.1".to_string()];
    if let Some(ip) = outbound_ipv4() {
        sans.push(ip.to_string());
    }

    let mut params =
        rcgen::CertificateParams::new(sans).context("invalid certificate parameters")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, host.clone());
    let key_pair = rcgen::KeyPair::generate().context("failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    std::fs::write(cert_path, cert.pem()).context("failed to write cert.pem")?;
    std::fs::write(key_path, key_pair.serialize_pem()).context("failed to write key.pem")?;
    info!(%host, cert = %cert_path.display(), "generated self-signed certificate");
    Ok(())
}

/// The local address the OS would route external IPv4 traffic from. The
/// datagram socket is never written to; `connect` only resolves the route.
fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 53)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generates_material_once() {
        rustls::crypto::ring::default_provider().install_default().ok();
        let dir = tempfile::tempdir().unwrap();
        let _config = load_or_create(dir.path()).await.unwrap();

        let cert = std::fs::read_to_string(dir.path().join(CERT_FILE)).unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        let key = std::fs::read_to_string(dir.path().join(KEY_FILE)).unwrap();
        assert!(key.contains("PRIVATE KEY"));

        // A second load reuses the material instead of regenerating it.
        let before = std::fs::metadata(dir.path().join(CERT_FILE)).unwrap().modified().unwrap();
        let _config = load_or_create(dir.path()).await.unwrap();
        let after = std::fs::metadata(dir.path().join(CERT_FILE)).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}
