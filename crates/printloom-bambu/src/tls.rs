//! TLS settings for LAN-mode printers.
//!
//! Printers present a self-signed certificate issued per device, so chain
//! and name verification are skipped. The same [`ClientConfig`] is shared by
//! the MQTT and FTPS channels so TLS sessions can be resumed on FTP data
//! connections.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

#[derive(Debug)]
struct DeviceCertificate;

impl ServerCertVerifier for DeviceCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Client config that accepts the printer's self-signed certificate.
pub fn device_client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeviceCertificate))
        .with_no_client_auth();
    Arc::new(config)
}

/// Server name for a host string (IP literal or DNS name).
pub fn server_name(host: &str) -> crate::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| crate::BambuError::TlsError(format!("invalid host {host}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_accepts_ip_and_dns() {
        assert!(matches!(server_name("192.168.1.20").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name("x1c.local").unwrap(), ServerName::DnsName(_)));
        assert!(server_name("not a host").is_err());
    }

    #[test]
    fn test_config_builds() {
        let config = device_client_config();
        assert!(config.alpn_protocols.is_empty());
    }
}
