//! Secret and TLS material resolution
//!
//! Descriptors never carry credentials inline, only [`SecretRef`]s. The
//! [`SecretResolver`] collaborator turns a reference into its value. The
//! default resolver reads secrets mounted as files, one directory per secret
//! and one file per key: `<mount>/<name>/<key>`.

use std::path::{Path, PathBuf};

use types::{SecretRef, TlsConfig};

use crate::error::SecretError;

/// Default location of mounted secrets
pub const DEFAULT_SECRETS_MOUNT: &str = "/etc/eventsource/secrets";

/// Resolves secret references into their contents
pub trait SecretResolver: Send + Sync {
    /// Raw secret bytes
    fn resolve_bytes(&self, secret: &SecretRef) -> Result<Vec<u8>, SecretError>;

    /// Secret as text with one trailing newline removed
    fn resolve(&self, secret: &SecretRef) -> Result<String, SecretError> {
        let bytes = self.resolve_bytes(secret)?;
        let mut text = String::from_utf8(bytes).map_err(|_| SecretError::NotUtf8 {
            secret: secret.to_string(),
        })?;
        if text.ends_with('\n') {
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }
        }
        if text.is_empty() {
            return Err(SecretError::Empty {
                secret: secret.to_string(),
            });
        }
        Ok(text)
    }
}

/// Reads secrets from a mounted volume
#[derive(Debug, Clone)]
pub struct VolumeSecretResolver {
    mount: PathBuf,
}

impl VolumeSecretResolver {
    /// Resolver rooted at `mount`
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
        }
    }

    /// Mount directory
    pub fn mount(&self) -> &Path {
        &self.mount
    }

    fn path_for(&self, secret: &SecretRef) -> PathBuf {
        self.mount.join(&secret.name).join(&secret.key)
    }
}

impl Default for VolumeSecretResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SECRETS_MOUNT)
    }
}

impl SecretResolver for VolumeSecretResolver {
    fn resolve_bytes(&self, secret: &SecretRef) -> Result<Vec<u8>, SecretError> {
        let path = self.path_for(secret);
        let bytes = std::fs::read(&path).map_err(|source| SecretError::Read {
            secret: secret.to_string(),
            path: path.clone(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(SecretError::Empty {
                secret: secret.to_string(),
            });
        }
        Ok(bytes)
    }
}

/// Resolved TLS material
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    /// PEM CA certificate
    pub ca_cert: Option<Vec<u8>>,
    /// PEM client certificate
    pub client_cert: Option<Vec<u8>>,
    /// PEM PKCS#8 client key
    pub client_key: Option<Vec<u8>>,
    /// Skip certificate verification
    pub insecure_skip_verify: bool,
}

impl TlsMaterial {
    /// Resolve every reference in `config`
    pub fn resolve(config: &TlsConfig, resolver: &dyn SecretResolver) -> Result<Self, SecretError> {
        let read = |secret: &Option<SecretRef>| -> Result<Option<Vec<u8>>, SecretError> {
            secret.as_ref().map(|s| resolver.resolve_bytes(s)).transpose()
        };

        Ok(Self {
            ca_cert: read(&config.ca_cert_secret)?,
            client_cert: read(&config.client_cert_secret)?,
            client_key: read(&config.client_key_secret)?,
            insecure_skip_verify: config.insecure_skip_verify,
        })
    }

    /// Build a native TLS connector from the material
    pub fn connector(&self) -> Result<native_tls::TlsConnector, SecretError> {
        let mut builder = native_tls::TlsConnector::builder();

        if let Some(ca) = &self.ca_cert {
            let cert = native_tls::Certificate::from_pem(ca)
                .map_err(|e| SecretError::Tls(format!("invalid CA certificate: {e}")))?;
            builder.add_root_certificate(cert);
        }

        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                let identity = native_tls::Identity::from_pkcs8(cert, key)
                    .map_err(|e| SecretError::Tls(format!("invalid client certificate: {e}")))?;
                builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(SecretError::Tls(
                    "client certificate and key must be provided together".to_string(),
                ))
            }
        }

        if self.insecure_skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }

        builder
            .build()
            .map_err(|e| SecretError::Tls(e.to_string()))
    }
}
