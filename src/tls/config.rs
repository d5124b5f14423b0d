//! TLS server configuration

use super::{Result, TlsError};
use openssl::pkey::PKey;
use openssl::ssl::{AlpnError, SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn to_openssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse case-insensitively, with or without the `v`
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// Client certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerify {
    /// Don't request client certificates
    None,
    /// Request a client certificate but don't require it
    Optional,
    /// Require a client certificate
    Required,
}

/// Immutable server-side TLS settings
#[derive(Clone)]
pub struct TlsServerConfig {
    pub(crate) ctx: SslContext,
}

impl TlsServerConfig {
    pub fn builder() -> TlsServerConfigBuilder {
        TlsServerConfigBuilder::new()
    }

    /// Server config with the built-in certificate and OpenSSL defaults
    pub fn with_builtin_cert() -> Result<Self> {
        Self::builder().build()
    }
}

/// Builder for [`TlsServerConfig`]
///
/// Setters that cannot report an error themselves keep the first failure
/// and return it from [`build`](Self::build).
pub struct TlsServerConfigBuilder {
    ctx_builder: Result<SslContextBuilder>,
    has_cert: bool,
}

impl TlsServerConfigBuilder {
    fn new() -> Self {
        TlsServerConfigBuilder {
            ctx_builder: SslContextBuilder::new(SslMethod::tls_server()).map_err(TlsError::from),
            has_cert: false,
        }
    }

    fn apply(
        mut self,
        f: impl FnOnce(&mut SslContextBuilder) -> std::result::Result<(), openssl::error::ErrorStack>,
    ) -> Self {
        if let Ok(builder) = &mut self.ctx_builder {
            if let Err(e) = f(builder) {
                self.ctx_builder = Err(e.into());
            }
        }
        self
    }

    fn try_apply(mut self, f: impl FnOnce(&mut SslContextBuilder) -> Result<()>) -> Result<Self> {
        match &mut self.ctx_builder {
            Ok(builder) => f(builder)?,
            Err(_) => {}
        }
        Ok(self)
    }

    /// Only allow `version`
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Allow versions from `min` to `max`
    pub fn version_range(self, min: TlsVersion, max: TlsVersion) -> Self {
        self.apply(|builder| {
            builder.set_min_proto_version(Some(min.to_openssl_version()))?;
            builder.set_max_proto_version(Some(max.to_openssl_version()))
        })
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(self, ciphers: &str) -> Result<Self> {
        self.try_apply(|builder| Ok(builder.set_cipher_list(ciphers)?))
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(self, ciphers: &str) -> Result<Self> {
        self.try_apply(|builder| Ok(builder.set_ciphersuites(ciphers)?))
    }

    /// Accept these ALPN protocols, in the client's order of preference
    pub fn alpn(self, protocols: &[&str]) -> Result<Self> {
        let supported: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        self.try_apply(move |builder| {
            builder.set_alpn_select_callback(move |_ssl, client_protos| {
                // Length-prefixed list
                let mut pos = 0;
                while pos < client_protos.len() {
                    let len = client_protos[pos] as usize;
                    pos += 1;
                    let Some(proto) = client_protos.get(pos..pos + len) else {
                        break;
                    };
                    if supported.iter().any(|p| p.as_slice() == proto) {
                        return Ok(proto);
                    }
                    pos += len;
                }
                Err(AlpnError::NOACK)
            });
            Ok(())
        })
    }

    /// Load certificate and private key from one PEM bundle
    pub fn cert_pem(mut self, pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;

        self = self.try_apply(|builder| {
            builder.set_certificate(&cert)?;
            builder.set_private_key(&key)?;
            Ok(builder.check_private_key()?)
        })?;
        self.has_cert = true;
        Ok(self)
    }

    /// Load certificate and private key from a PEM file
    pub fn cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let pem = fs::read(path.as_ref())?;
        self.cert_pem(&pem)
    }

    /// Set client certificate verification mode
    pub fn client_verify(self, mode: ClientVerify) -> Self {
        let verify_mode = match mode {
            ClientVerify::None => SslVerifyMode::NONE,
            ClientVerify::Optional => SslVerifyMode::PEER,
            ClientVerify::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        };
        self.apply(|builder| {
            builder.set_verify(verify_mode);
            Ok(())
        })
    }

    /// Set CA file for client certificate verification
    pub fn client_verify_ca<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        self.try_apply(|builder| Ok(builder.set_ca_file(path.as_ref())?))
    }

    /// Build the configuration, using the built-in certificate if none was loaded
    pub fn build(mut self) -> Result<TlsServerConfig> {
        if !self.has_cert {
            self = self.cert_pem(super::builtin_cert::BUILTIN_CERT.as_bytes())?;
        }
        Ok(TlsServerConfig {
            ctx: self.ctx_builder?.build(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert!("SSLv3".parse::<TlsVersion>().is_err());
        assert_eq!(TlsVersion::Tls11.as_str(), "TLSv1.1");
    }

    #[test]
    fn test_builtin_cert_config() {
        TlsServerConfig::builder()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .client_verify(ClientVerify::Optional)
            .alpn(&["h2", "http/1.1"])
            .unwrap()
            .build()
            .unwrap();
    }

    #[test]
    fn test_cert_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(super::super::builtin_cert::BUILTIN_CERT.as_bytes())
            .unwrap();

        TlsServerConfig::builder()
            .cert_file(file.path())
            .unwrap()
            .build()
            .unwrap();
    }

    #[test]
    fn test_invalid_cert() {
        assert!(matches!(
            TlsServerConfig::builder().cert_pem(b"not a certificate"),
            Err(TlsError::Certificate(_))
        ));
        assert!(TlsServerConfig::builder()
            .cert_file("/nonexistent/server.pem")
            .is_err());
    }

    #[test]
    fn test_invalid_cipher_list() {
        assert!(TlsServerConfig::builder()
            .cipher_list("NOT-A-CIPHER")
            .is_err());
    }
}
