// asyncoro-net - distributed coroutine transport: peer discovery, request
// pipeline, and file transfer for a mesh of scheduler instances.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Thin wrapper around a plain or TLS-wrapped `TcpStream`: non-blocking
//! connect/accept with optional TLS, with framing layered on top by `wire`.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;
use crate::error::{NetError, NetResult};

/// Material used to wrap outbound/inbound TCP connections in TLS. Absent
/// when the instance runs without `certfile`/`keyfile`.
#[derive(Clone)]
pub struct TlsMaterial {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsMaterial {
    pub fn load(config: &TlsConfig) -> NetResult<Self> {
        let certs = load_certs(&config.certfile)?;
        let key = load_key(&config.keyfile)?;

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key)
            .map_err(|e| NetError::TlsError(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        for cert in &certs {
            root_store
                .add(cert)
                .map_err(|e| NetError::TlsError(e.to_string()))?;
        }
        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }
}

fn load_certs(path: &str) -> NetResult<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| NetError::TlsError(e.to_string()))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> NetResult<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| NetError::TlsError(e.to_string()))?;
    keys.pop()
        .map(PrivateKey)
        .ok_or_else(|| NetError::TlsError(format!("no private key found in {}", path)))
}

/// A connection that is either a plain TCP stream or one wrapped in TLS.
/// Implements `AsyncRead`/`AsyncWrite` by delegation so the framing layer
/// above is agnostic to which variant is in play. The two TLS variants hold
/// the connector's and acceptor's own stream types directly (`client::TlsStream`/
/// `server::TlsStream`) rather than guessing at a unified wrapper type.
pub enum Transport {
    Plain(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Transport {
    pub async fn connect(addr: SocketAddr, tls: Option<&TlsMaterial>) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        match tls {
            None => Ok(Transport::Plain(stream)),
            Some(material) => {
                let domain = rustls::ServerName::IpAddress(addr.ip());
                let tls_stream = material
                    .connector
                    .connect(domain, stream)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(Transport::TlsClient(Box::new(tls_stream)))
            }
        }
    }

    pub async fn accept(stream: TcpStream, tls: Option<&TlsMaterial>) -> io::Result<Self> {
        match tls {
            None => Ok(Transport::Plain(stream)),
            Some(material) => {
                let tls_stream = material
                    .acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(Transport::TlsServer(Box::new(tls_stream)))
            }
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
