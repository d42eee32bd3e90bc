//! Error types for Bambu integration.

use thiserror::Error;

/// Errors from Bambu printer operations.
#[derive(Error, Debug)]
pub enum BambuError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// MQTT error.
    #[error("MQTT error: {0}")]
    MqttError(String),

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The FTP server answered with an unexpected reply.
    #[error("FTP {code}: {message}")]
    FtpReply {
        /// Reply code.
        code: u16,
        /// Reply text.
        message: String,
    },

    /// The FTP server sent something that is not a reply.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Container could not be built or read.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// ZIP error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl BambuError {
    /// Replies the device sends spuriously after a complete upload.
    pub fn is_transient_transfer(&self) -> bool {
        matches!(self, BambuError::FtpReply { code: 426 | 451, .. })
    }
}

/// Result type for Bambu operations.
pub type Result<T> = std::result::Result<T, BambuError>;
