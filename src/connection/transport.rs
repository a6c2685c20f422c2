//! Socket transport: plain TCP, optionally upgraded to TLS

use super::tls::TlsConfig;
use crate::{Error, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The connection's byte stream.
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP, negotiated via SSLRequest
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain"),
            Transport::Tls(_) => f.write_str("Transport::Tls"),
        }
    }
}

impl Transport {
    /// Open a plain TCP connection.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Plain(stream))
    }

    /// Upgrade a plain connection after the server accepted SSLRequest.
    pub async fn upgrade_to_tls(self, tls: &TlsConfig, hostname: &str) -> Result<Self> {
        match self {
            Transport::Plain(stream) => {
                let server_name = rustls_pki_types::ServerName::try_from(hostname.to_string())
                    .map_err(|_| {
                        Error::Config(format!("invalid hostname for TLS: {:?}", hostname))
                    })?;
                let connector = tokio_rustls::TlsConnector::from(tls.client_config());
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| Error::Config(format!("TLS handshake failed: {}", e)))?;
                Ok(Transport::Tls(Box::new(tls_stream)))
            }
            Transport::Tls(_) => Err(Error::Config("transport is already TLS-encrypted".into())),
        }
    }

    /// Write all bytes and flush.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await?;
            }
            Transport::Tls(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    /// Read available bytes into the buffer; 0 means EOF.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Plain(stream) => stream.read_buf(buf).await?,
            Transport::Tls(stream) => stream.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Read exactly one byte (the SSLRequest response).
    pub async fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        match self {
            Transport::Plain(stream) => stream.read_exact(&mut byte).await?,
            Transport::Tls(stream) => stream.read_exact(&mut byte).await?,
        };
        Ok(byte[0])
    }

    /// Shut the stream down; errors are of no further interest.
    pub async fn shutdown(&mut self) {
        let _ = match self {
            Transport::Plain(stream) => stream.shutdown().await,
            Transport::Tls(stream) => stream.shutdown().await,
        };
    }
}
