// SPDX-License-Identifier: MIT
//! Transport security: TLS acceptor construction for security profiles
//! 2 and 3, HTTP Basic Auth validation for profiles 1 and 2, and
//! constant-time token comparison so a slow string compare can't leak a
//! valid token one byte at a time.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::{SecurityProfile, TlsConfig};

/// Captured once at upgrade, per the wire contract's handshake-info shape:
/// identity, remote address, offered subprotocols, URL path, the security
/// profile in effect, and whatever credential material that profile implies
/// (a Basic-Auth password, or a client certificate under mutual TLS).
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub identity: String,
    pub remote_addr: IpAddr,
    pub path: String,
    pub offered_subprotocols: Vec<String>,
    pub negotiated_subprotocol: Option<String>,
    pub security_profile: SecurityProfile,
    /// Password bytes from `Authorization: Basic`, split on the first colon
    /// only so embedded colons in the password survive.
    pub basic_auth_password: Option<Vec<u8>>,
    /// DER-encoded peer certificate chain, present only under mutual TLS.
    pub client_cert: Option<Vec<CertificateDer<'static>>>,
}

/// An auth callback's decision, settled exactly once per upgrade.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    Accept,
    /// Reject with a WebSocket close code and a human-readable reason,
    /// mirroring the wire contract's `reject(code, message)`.
    Reject { code: u16, reason: String },
}

/// Pluggable upgrade-time authentication, invoked once per connection after
/// the WebSocket handshake completes but before the session is handed to the
/// embedding application's [`crate::endpoint::ActionHandler`].
///
/// Registering one is optional — `server::run`'s `auth: None` accepts every
/// upgrade regardless of security profile, same as "no auth callback
/// registered" in the wire contract.
#[async_trait]
pub trait AuthCallback: Send + Sync {
    /// `signal` is cancelled if the server begins shutting down while this
    /// call is pending; the caller also races it against `handshakeTimeoutMs`.
    async fn authenticate(&self, info: HandshakeInfo, signal: CancellationToken) -> AuthDecision;
}

/// Build a `rustls` server config from the configured cert/key (and, for
/// mTLS, client CA bundle), returning a ready-to-use [`TlsAcceptor`].
pub fn build_tls_acceptor(profile: SecurityProfile, tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_path = tls
        .cert_path
        .as_ref()
        .context("TLS certificate path is required for this security profile")?;
    let key_path = tls
        .key_path
        .as_ref()
        .context("TLS key path is required for this security profile")?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = if profile == SecurityProfile::MutualTls {
        let ca_path = tls
            .client_ca_path
            .as_ref()
            .context("client CA path is required for mutual TLS (security profile 3)")?;
        let ca_certs = load_certs(ca_path)?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).context("failed to add client CA cert to root store")?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("failed to build mTLS client verifier")?;
        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .context("failed to build mTLS server config")?
    } else {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("failed to build TLS server config")?
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening cert file {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certs from {}", path.display()))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening key file {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing private key from {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// The front-door/auth failure taxonomy the wire contract requires every
/// rejected connection attempt to be classified under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventType {
    AuthFailed,
    ConnectionRateLimit,
    UpgradeAborted,
    InvalidPayload,
    RateLimitExceeded,
}

impl std::fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityEventType::AuthFailed => "AUTH_FAILED",
            SecurityEventType::ConnectionRateLimit => "CONNECTION_RATE_LIMIT",
            SecurityEventType::UpgradeAborted => "UPGRADE_ABORTED",
            SecurityEventType::InvalidPayload => "INVALID_PAYLOAD",
            SecurityEventType::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        };
        f.write_str(s)
    }
}

/// Emit a structured security event. A plain `tracing::warn!` carrying the
/// event type as a field, rather than a bespoke event bus — this codebase's
/// ambient logging already gives every subscriber (a tracing layer shipping
/// to a SIEM, a test's `tracing-test` capture) the same structured access a
/// dedicated `securityEvent` channel would.
pub fn emit_security_event(event: SecurityEventType, peer: IpAddr, reason: &str) {
    tracing::warn!(security_event = %event, peer = %peer, reason, "security event");
}

/// Decode and validate an `Authorization: Basic <base64>` header against the
/// expected `identity:password` pair. Uses a constant-time comparison on the
/// decoded password so a timing attack can't binary-search the secret.
pub fn validate_basic_auth(header_value: &str, expected_identity: &str, expected_password: &str) -> bool {
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((identity, password)) = decoded.split_once(':') else {
        return false;
    };
    identity == expected_identity && tokens_equal(password, expected_password)
}

/// Parse an `Authorization: Basic <base64>` header into its password bytes,
/// bound to whatever identity preceded the first colon. Used to populate
/// [`HandshakeInfo::basic_auth_password`] for a registered [`AuthCallback`]
/// to check against its own credential store — unlike [`validate_basic_auth`],
/// this doesn't assume a single shared identity/password pair.
pub fn parse_basic_auth_password(header_value: &str) -> Option<Vec<u8>> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_identity, password) = decoded.split_once(':')?;
    Some(password.as_bytes().to_vec())
}

/// Constant-time string comparison — always walks the full length of the
/// longer input so comparison time doesn't leak how many leading characters
/// matched.
pub fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let max_len = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u8;
    for i in 0..max_len {
        let byte_a = a.get(i).copied().unwrap_or(0);
        let byte_b = b.get(i).copied().unwrap_or(0);
        diff |= byte_a ^ byte_b;
    }
    diff == 0
}

/// Validate that a peer's requested subprotocol is acceptable.
///
/// In non-strict mode, an unrecognized subprotocol falls back to `None`
/// (no subprotocol negotiated) rather than rejecting the connection; strict
/// mode rejects outright.
pub fn negotiate_subprotocol(requested: &[String], supported: &[String], strict: bool) -> Result<Option<String>> {
    for candidate in supported {
        if requested.contains(candidate) {
            return Ok(Some(candidate.clone()));
        }
    }
    if strict {
        bail!("no mutually supported subprotocol among {requested:?}");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_equal_matches_identical_strings() {
        assert!(tokens_equal("secret-token", "secret-token"));
    }

    #[test]
    fn tokens_equal_rejects_mismatch() {
        assert!(!tokens_equal("secret-token", "wrong-token"));
    }

    #[test]
    fn tokens_equal_rejects_different_lengths() {
        assert!(!tokens_equal("short", "much-longer-token"));
    }

    #[test]
    fn basic_auth_accepts_correct_credentials() {
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("CP001:sekret")
        );
        assert!(validate_basic_auth(&header, "CP001", "sekret"));
    }

    #[test]
    fn basic_auth_rejects_wrong_password() {
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("CP001:wrong")
        );
        assert!(!validate_basic_auth(&header, "CP001", "sekret"));
    }

    #[test]
    fn basic_auth_rejects_non_basic_scheme() {
        assert!(!validate_basic_auth("Bearer abc123", "CP001", "sekret"));
    }

    #[test]
    fn parse_basic_auth_password_preserves_embedded_colons() {
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("CP001:sek:ret")
        );
        assert_eq!(parse_basic_auth_password(&header), Some(b"sek:ret".to_vec()));
    }

    #[test]
    fn parse_basic_auth_password_rejects_non_basic_scheme() {
        assert_eq!(parse_basic_auth_password("Bearer abc123"), None);
    }

    #[test]
    fn negotiate_picks_first_supported_match() {
        let requested = vec!["ocpp1.6".to_string(), "ocpp2.0.1".to_string()];
        let supported = vec!["ocpp2.0.1".to_string(), "ocpp1.6".to_string()];
        let result = negotiate_subprotocol(&requested, &supported, false).unwrap();
        assert_eq!(result, Some("ocpp2.0.1".to_string()));
    }

    #[test]
    fn negotiate_falls_back_to_none_when_lenient() {
        let requested = vec!["ocpp0.9".to_string()];
        let supported = vec!["ocpp2.0.1".to_string()];
        let result = negotiate_subprotocol(&requested, &supported, false).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn negotiate_rejects_when_strict() {
        let requested = vec!["ocpp0.9".to_string()];
        let supported = vec!["ocpp2.0.1".to_string()];
        assert!(negotiate_subprotocol(&requested, &supported, true).is_err());
    }
}
