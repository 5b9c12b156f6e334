//! Certificate Manager - TLS identity lifecycle
//!
//! ## Responsibilities
//!
//! - Load the on-disk certificate when it still has 30 days of validity
//! - Otherwise generate a 2048-bit RSA self-signed certificate with SANs
//!   for localhost and both loopback addresses
//! - Write atomically (temp file + rename), key encrypted with the
//!   configured secret when one is set
//! - Best-effort install into the user trust store, idempotent by
//!   thumbprint; failure never blocks the TLS listener
//!
//! The bundle is a PEM pair plus a JSON metadata sidecar used for the
//! renewal check and trust idempotence.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Renew when less than this much validity remains
const RENEW_WINDOW_DAYS: i64 = 30;

/// Metadata sidecar written next to the certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertMetadata {
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SHA-1 of the certificate DER, lowercase hex
    pub thumbprint: String,
}

/// A loaded or freshly generated TLS identity
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub metadata: CertMetadata,
}

impl TlsIdentity {
    /// rustls acceptor configuration; TLS 1.2/1.3 only
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|err| Error::Internal(format!("TLS configuration rejected: {err}")))?;
        Ok(Arc::new(config))
    }
}

pub struct CertManager {
    cert_path: PathBuf,
    password: String,
    validity_days: u32,
    auto_install: bool,
    subject: String,
}

impl CertManager {
    pub fn new(
        cert_path: PathBuf,
        password: String,
        validity_days: u32,
        auto_install: bool,
        subject: String,
    ) -> Self {
        Self {
            cert_path,
            password,
            validity_days,
            auto_install,
            subject,
        }
    }

    fn key_path(&self) -> PathBuf {
        self.cert_path.with_extension("key")
    }

    fn meta_path(&self) -> PathBuf {
        self.cert_path.with_extension("json")
    }

    /// Load-or-provision the TLS identity
    ///
    /// `None` means the WSS listener stays down; the daemon still runs the
    /// plaintext endpoint.
    pub async fn obtain(&self) -> Option<TlsIdentity> {
        match self.load().await {
            Ok(Some(identity)) => {
                tracing::info!(
                    thumbprint = %identity.metadata.thumbprint,
                    not_after = %identity.metadata.not_after,
                    "Certificate loaded"
                );
                self.maybe_install(&identity).await;
                return Some(identity);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "Existing certificate unusable, regenerating");
            }
        }

        match self.generate().await {
            Ok(identity) => {
                tracing::info!(
                    thumbprint = %identity.metadata.thumbprint,
                    not_after = %identity.metadata.not_after,
                    "Certificate generated"
                );
                self.maybe_install(&identity).await;
                Some(identity)
            }
            Err(err) => {
                tracing::error!(error = %err, "Certificate provisioning failed, WSS disabled");
                None
            }
        }
    }

    /// Load the on-disk bundle when present and not close to expiry
    async fn load(&self) -> Result<Option<TlsIdentity>> {
        let meta_text = match tokio::fs::read_to_string(self.meta_path()).await {
            Ok(text) => text,
            Err(_) => return Ok(None),
        };
        let metadata: CertMetadata = serde_json::from_str(&meta_text)?;

        if metadata.not_after - Utc::now() < Duration::days(RENEW_WINDOW_DAYS) {
            tracing::info!(not_after = %metadata.not_after, "Certificate is within the renewal window");
            return Ok(None);
        }

        let cert_pem = tokio::fs::read(&self.cert_path).await?;
        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| Error::Internal(format!("certificate parse failed: {err}")))?;
        if cert_chain.is_empty() {
            return Err(Error::Internal("certificate file holds no certificate".into()));
        }

        let key_text = tokio::fs::read_to_string(self.key_path()).await?;
        let key = self.decode_key(&key_text)?;

        Ok(Some(TlsIdentity {
            cert_chain,
            key,
            metadata,
        }))
    }

    fn decode_key(&self, pem: &str) -> Result<PrivateKeyDer<'static>> {
        let (label, document) = pkcs8::Document::from_pem(pem)
            .map_err(|err| Error::Internal(format!("key parse failed: {err}")))?;

        let der = if label == "ENCRYPTED PRIVATE KEY" {
            if self.password.is_empty() {
                return Err(Error::Internal(
                    "key is encrypted but no certificate password is configured".into(),
                ));
            }
            let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes())
                .map_err(|err| Error::Internal(format!("encrypted key parse failed: {err}")))?;
            let secret = encrypted
                .decrypt(self.password.as_bytes())
                .map_err(|err| Error::Internal(format!("key decryption failed: {err}")))?;
            secret.as_bytes().to_vec()
        } else {
            document.as_bytes().to_vec()
        };

        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)))
    }

    /// Generate and persist a fresh self-signed identity
    async fn generate(&self) -> Result<TlsIdentity> {
        // RSA keygen is CPU-bound; keep it off the reactor
        let rsa_key = tokio::task::spawn_blocking(|| RsaPrivateKey::new(&mut OsRng, 2048))
            .await
            .map_err(|err| Error::Internal(format!("keygen task failed: {err}")))?
            .map_err(|err| Error::Internal(format!("RSA key generation failed: {err}")))?;

        let key_document = rsa_key
            .to_pkcs8_der()
            .map_err(|err| Error::Internal(format!("key encoding failed: {err}")))?;
        let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(key_document.as_bytes()),
            &rcgen::PKCS_RSA_SHA256,
        )
        .map_err(|err| Error::Internal(format!("signing key rejected: {err}")))?;

        let not_before = Utc::now() - Duration::days(1);
        let not_after = Utc::now() + Duration::days(self.validity_days as i64);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "localhost");
        params.distinguished_name = dn;

        let mut sans = vec![SanType::DnsName(
            Ia5String::try_from("localhost".to_string())
                .map_err(|err| Error::Internal(format!("SAN rejected: {err}")))?,
        )];
        if self.subject != "localhost" {
            sans.push(SanType::DnsName(
                Ia5String::try_from(self.subject.clone())
                    .map_err(|err| Error::Internal(format!("SAN rejected: {err}")))?,
            ));
        }
        sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        sans.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        params.subject_alt_names = sans;

        params.not_before = to_rcgen_time(not_before);
        params.not_after = to_rcgen_time(not_after);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let certificate = params
            .self_signed(&key_pair)
            .map_err(|err| Error::Internal(format!("certificate signing failed: {err}")))?;

        let cert_der = certificate.der().clone();
        let thumbprint = thumbprint_of(cert_der.as_ref());
        let metadata = CertMetadata {
            subject: self.subject.clone(),
            not_before,
            not_after,
            thumbprint,
        };

        let key_pem: String = if self.password.is_empty() {
            rsa_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|err| Error::Internal(format!("key encoding failed: {err}")))?
                .to_string()
        } else {
            let info = pkcs8::PrivateKeyInfo::try_from(key_document.as_bytes())
                .map_err(|err| Error::Internal(format!("key encoding failed: {err}")))?;
            let encrypted = info
                .encrypt(OsRng, self.password.as_bytes())
                .map_err(|err| Error::Internal(format!("key encryption failed: {err}")))?;
            encrypted
                .to_pem("ENCRYPTED PRIVATE KEY", pkcs8::LineEnding::LF)
                .map_err(|err| Error::Internal(format!("key encoding failed: {err}")))?
                .to_string()
        };

        self.persist(&certificate.pem(), &key_pem, &metadata).await?;

        Ok(TlsIdentity {
            cert_chain: vec![cert_der],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                key_document.as_bytes().to_vec(),
            )),
            metadata,
        })
    }

    /// Atomic write of the three bundle files
    async fn persist(&self, cert_pem: &str, key_pem: &str, metadata: &CertMetadata) -> Result<()> {
        if let Some(parent) = self.cert_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&self.cert_path, cert_pem.as_bytes()).await?;
        write_atomic(&self.key_path(), key_pem.as_bytes()).await?;
        restrict_permissions(&self.key_path()).await;
        write_atomic(
            &self.meta_path(),
            serde_json::to_string_pretty(metadata)?.as_bytes(),
        )
        .await?;
        Ok(())
    }

    async fn maybe_install(&self, identity: &TlsIdentity) {
        if !self.auto_install {
            return;
        }
        match self.install_user_trust(identity).await {
            Ok(true) => tracing::info!("Certificate present in the user trust store"),
            Ok(false) => {
                tracing::warn!("Certificate trust installation skipped; browsers may warn")
            }
            Err(err) => {
                // Non-fatal by design; WSS still starts
                tracing::warn!(error = %err, "Certificate trust installation failed");
            }
        }
    }

    /// Install into the user's NSS database via certutil, keyed by
    /// thumbprint so repeat runs are no-ops
    async fn install_user_trust(&self, identity: &TlsIdentity) -> Result<bool> {
        let Some(home) = dirs::home_dir() else {
            return Ok(false);
        };
        let db = format!("sql:{}/.pki/nssdb", home.display());
        let nickname = format!(
            "scanbridge-{}",
            &identity.metadata.thumbprint[..12.min(identity.metadata.thumbprint.len())]
        );

        // Already trusted: never install twice
        match Command::new("certutil")
            .args(["-d", &db, "-L", "-n", &nickname])
            .output()
            .await
        {
            Ok(output) if output.status.success() => return Ok(true),
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "certutil not available");
                return Ok(false);
            }
        }

        let output = Command::new("certutil")
            .args([
                "-d",
                &db,
                "-A",
                "-t",
                "C,,",
                "-n",
                &nickname,
                "-i",
                &self.cert_path.display().to_string(),
            ])
            .output()
            .await?;

        if output.status.success() {
            Ok(true)
        } else {
            Err(Error::Internal(format!(
                "certutil exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) =
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    {
        tracing::warn!(path = %path.display(), error = %err, "Key permission tightening failed");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

fn thumbprint_of(der: &[u8]) -> String {
    let digest = Sha1::digest(der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn to_rcgen_time(when: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(when.timestamp())
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path, password: &str, validity_days: u32) -> CertManager {
        CertManager::new(
            dir.join("certificate.pem"),
            password.to_string(),
            validity_days,
            false,
            "localhost".to_string(),
        )
    }

    #[tokio::test]
    async fn generates_and_reloads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), "", 365);

        let generated = manager.obtain().await.expect("generation");
        assert_eq!(generated.metadata.thumbprint.len(), 40);
        assert!(dir.path().join("certificate.pem").exists());
        assert!(dir.path().join("certificate.key").exists());
        assert!(dir.path().join("certificate.json").exists());

        // Second obtain loads the same certificate instead of regenerating
        let loaded = manager.obtain().await.expect("load");
        assert_eq!(loaded.metadata.thumbprint, generated.metadata.thumbprint);

        // And it builds an acceptor config
        assert!(loaded.server_config().is_ok());
    }

    #[tokio::test]
    async fn near_expiry_triggers_regeneration() {
        let dir = tempfile::tempdir().unwrap();
        // Valid 10 days, inside the 30-day renewal window
        let short = manager(dir.path(), "", 10);
        let first = short.obtain().await.expect("generation");

        let second = short.obtain().await.expect("regeneration");
        assert_ne!(first.metadata.thumbprint, second.metadata.thumbprint);
    }

    #[tokio::test]
    async fn password_encrypts_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), "hunter2", 365);

        let generated = manager.obtain().await.expect("generation");
        let key_pem = tokio::fs::read_to_string(dir.path().join("certificate.key"))
            .await
            .unwrap();
        assert!(key_pem.contains("ENCRYPTED PRIVATE KEY"));

        let loaded = manager.obtain().await.expect("load");
        assert_eq!(loaded.metadata.thumbprint, generated.metadata.thumbprint);

        // The wrong password refuses to load and falls back to regeneration
        let wrong = CertManager::new(
            dir.path().join("certificate.pem"),
            "letmein".to_string(),
            365,
            false,
            "localhost".to_string(),
        );
        let regenerated = wrong.obtain().await.expect("regeneration");
        assert_ne!(regenerated.metadata.thumbprint, generated.metadata.thumbprint);
    }
}
