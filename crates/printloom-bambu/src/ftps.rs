//! Implicit FTPS upload to the printer's storage.
//!
//! The device runs an FTP server on port 990 that expects TLS from the first
//! byte, user `bblp` and the LAN access code as password. Data connections
//! are passive and also encrypted (`PROT P`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use printloom_core::ConnectionConfig;
use rustls::ClientConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{BambuError, Result};
use crate::mqtt::LAN_USER;
use crate::tls::server_name;
use crate::transport::FileTransfer;

/// Default implicit FTPS port.
pub const FTPS_PORT: u16 = 990;

/// A complete (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit code.
    pub code: u16,
    /// Text after the code, lines joined with `\n`.
    pub text: String,
}

impl Reply {
    /// 2xx.
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn into_error(self) -> BambuError {
        BambuError::FtpReply {
            code: self.code,
            message: self.text,
        }
    }
}

/// Split `"226 Transfer complete"` into code, separator and text.
pub fn parse_reply_line(line: &str) -> Result<(u16, char, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let invalid = || BambuError::InvalidResponse(line.to_string());

    let code = line.get(..3).ok_or_else(invalid)?;
    let code: u16 = code.parse().map_err(|_| invalid())?;
    let sep = line[3..].chars().next().unwrap_or(' ');
    if sep != ' ' && sep != '-' {
        return Err(invalid());
    }
    let text = line.get(4..).unwrap_or("");
    Ok((code, sep, text))
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub fn parse_pasv(text: &str) -> Result<u16> {
    let invalid = || BambuError::InvalidResponse(format!("bad PASV reply: {text}"));
    let start = text.find('(').ok_or_else(invalid)?;
    let end = text[start..].find(')').ok_or_else(invalid)? + start;

    let fields: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse::<u16>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| invalid())?;
    if fields.len() != 6 || fields.iter().any(|f| *f > 255) {
        return Err(invalid());
    }
    Ok(fields[4] * 256 + fields[5])
}

/// FTP control channel over any byte stream.
pub struct FtpControl<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FtpControl<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(BambuError::ConnectionFailed(
                "FTP control connection closed".into(),
            ));
        }
        Ok(line)
    }

    /// Read one reply, following multi-line `xyz-` continuations.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let first = self.read_line().await?;
        let (code, sep, text) = parse_reply_line(&first)?;
        let mut text = text.to_string();

        if sep == '-' {
            let terminator = format!("{code} ");
            let continuation = format!("{code}-");
            loop {
                let line = self.read_line().await?;
                let trimmed = line.trim_end_matches(['\r', '\n']);
                text.push('\n');
                if let Some(last) = trimmed.strip_prefix(&terminator) {
                    text.push_str(last);
                    break;
                }
                text.push_str(trimmed.strip_prefix(&continuation).unwrap_or(trimmed));
            }
        }

        Ok(Reply { code, text })
    }

    /// Send a raw command without waiting for the reply.
    pub async fn write_command(&mut self, command: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Send a command and read its reply.
    pub async fn send(&mut self, command: &str) -> Result<Reply> {
        self.write_command(command).await?;
        self.read_reply().await
    }

    /// Send a command and fail unless the reply code is in `accepted`.
    pub async fn expect(&mut self, command: &str, accepted: &[u16]) -> Result<Reply> {
        let reply = self.send(command).await?;
        if accepted.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply.into_error())
        }
    }

    /// Consume the greeting, authenticate, and switch to protected binary mode.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let greeting = self.read_reply().await?;
        if greeting.code != 220 {
            return Err(greeting.into_error());
        }

        let reply = self.expect(&format!("USER {user}"), &[230, 331]).await?;
        if reply.code == 331 {
            self.expect(&format!("PASS {password}"), &[230, 202]).await?;
        }

        self.expect("PBSZ 0", &[200]).await?;
        self.expect("PROT P", &[200]).await?;
        self.expect("TYPE I", &[200]).await?;
        Ok(())
    }

    /// Enter passive mode and return the data port.
    pub async fn passive(&mut self) -> Result<u16> {
        let reply = self.expect("PASV", &[227]).await?;
        parse_pasv(&reply.text)
    }

    /// Size of a remote file, `None` when it does not exist.
    pub async fn size(&mut self, name: &str) -> Result<Option<u64>> {
        let reply = self.send(&format!("SIZE {name}")).await?;
        match reply.code {
            213 => reply
                .text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| BambuError::InvalidResponse(reply.text.clone())),
            550 => Ok(None),
            _ => Err(reply.into_error()),
        }
    }

    /// Say goodbye. Errors are irrelevant at this point.
    pub async fn quit(&mut self) {
        let _ = self.send("QUIT").await;
    }
}

/// [`FileTransfer`] over implicit FTPS.
#[derive(Clone)]
pub struct FtpsTransfer {
    tls: Arc<ClientConfig>,
    port: u16,
    timeout: Duration,
}

impl FtpsTransfer {
    /// Create a transfer client. `timeout` bounds a whole upload.
    pub fn new(tls: Arc<ClientConfig>, timeout: Duration) -> Self {
        Self {
            tls,
            port: FTPS_PORT,
            timeout,
        }
    }

    /// Override the server port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn tls(&self, host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        TlsConnector::from(self.tls.clone())
            .connect(server_name(host)?, tcp)
            .await
            .map_err(|e| BambuError::TlsError(e.to_string()))
    }

    async fn session(&self, config: &ConnectionConfig) -> Result<FtpControl<TlsStream<TcpStream>>> {
        let tcp = TcpStream::connect((config.host.as_str(), self.port)).await?;
        let mut control = FtpControl::new(self.tls(&config.host, tcp).await?);
        control.login(LAN_USER, &config.access_code).await?;
        Ok(control)
    }

    async fn store(&self, config: &ConnectionConfig, remote_name: &str, data: &[u8]) -> Result<()> {
        let mut control = self.session(config).await?;
        let port = control.passive().await?;

        // The advertised address may be unroutable; the port is what matters.
        let tcp = TcpStream::connect((config.host.as_str(), port)).await?;
        let reply = control.send(&format!("STOR {remote_name}")).await?;
        if !matches!(reply.code, 125 | 150) {
            return Err(reply.into_error());
        }

        let transfer = async {
            let mut stream = TlsConnector::from(self.tls.clone())
                .connect(server_name(&config.host)?, tcp)
                .await?;
            stream.write_all(data).await?;
            stream.shutdown().await?;
            Ok::<_, BambuError>(())
        }
        .await;

        let done = control.read_reply().await;
        control.quit().await;

        match (transfer, done) {
            (_, Ok(reply)) if reply.is_completion() => Ok(()),
            (_, Ok(reply)) => Err(reply.into_error()),
            (Err(e), Err(_)) => Err(e),
            (Ok(()), Err(e)) => Err(e),
        }
    }

    async fn size(&self, config: &ConnectionConfig, remote_name: &str) -> Result<Option<u64>> {
        let mut control = self.session(config).await?;
        let size = control.size(remote_name).await;
        control.quit().await;
        size
    }
}

#[async_trait]
impl FileTransfer for FtpsTransfer {
    async fn upload(&self, config: &ConnectionConfig, local: &Path, remote_name: &str) -> Result<()> {
        let data = tokio::fs::read(local).await?;
        tracing::debug!(host = %config.host, file = remote_name, bytes = data.len(), "FTPS upload");
        tokio::time::timeout(self.timeout, self.store(config, remote_name, &data))
            .await
            .map_err(|_| BambuError::Timeout(format!("upload of {remote_name}")))?
    }

    async fn remote_size(&self, config: &ConnectionConfig, remote_name: &str) -> Result<Option<u64>> {
        tokio::time::timeout(self.timeout, self.size(config, remote_name))
            .await
            .map_err(|_| BambuError::Timeout(format!("SIZE {remote_name}")))?
    }
}
