//! Negotiated TLS session details
//!
//! Captured once the handshake completes and stored in the connection
//! features, where the request engine can look them up.

use openssl::nid::Nid;
use openssl::ssl::{NameType, SslRef};
use openssl::x509::{X509NameRef, X509Ref};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Summary of an X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject common name
    pub subject: String,
    /// Issuer common name
    pub issuer: String,
    /// DNS and IP subject alternative names, as `DNS:name` / `IP:addr`
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
        }
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(names) = cert.subject_alt_names() else {
        return Vec::new();
    };

    names
        .iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(format!("DNS:{}", dns));
            }
            match name.ipaddress()? {
                ip if ip.len() == 4 => {
                    let octets: [u8; 4] = ip.try_into().ok()?;
                    Some(format!("IP:{}", Ipv4Addr::from(octets)))
                }
                ip if ip.len() == 16 => {
                    let octets: [u8; 16] = ip.try_into().ok()?;
                    Some(format!("IP:{}", Ipv6Addr::from(octets)))
                }
                _ => None,
            }
        })
        .collect()
}

/// What a TLS handshake negotiated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConnectionInfo {
    /// Protocol version, e.g. `TLSv1.3`
    pub version: String,
    /// Cipher suite name
    pub cipher: Option<String>,
    /// SNI host name sent by the client
    pub servername: Option<String>,
    /// Selected ALPN protocol
    pub alpn: Option<String>,
    pub session_reused: bool,
    /// Client certificate, if one was presented
    pub peer_certificate: Option<CertInfo>,
}

impl TlsConnectionInfo {
    pub fn from_ssl(ssl: &SslRef) -> Self {
        TlsConnectionInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(str::to_string),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            session_reused: ssl.session_reused(),
            peer_certificate: ssl.peer_certificate().map(|cert| CertInfo::from_x509(&cert)),
        }
    }

    /// Whether `protocol` was selected through ALPN
    pub fn negotiated(&self, protocol: &str) -> bool {
        self.alpn.as_deref() == Some(protocol)
    }
}
