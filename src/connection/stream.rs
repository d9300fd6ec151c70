//! Transport layer: TCP, TLS over TCP and Unix domain sockets.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{self, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::config::{Address, Config};
use crate::error::{Error, Result};

#[cfg(feature = "tls-rustls")]
use std::sync::Arc;
#[cfg(feature = "tls-rustls")]
use tokio_rustls::{client::TlsStream, TlsConnector};

/// The connected transport. TLS streams are single-use: every reconnect
/// builds a fresh one.
pub(crate) enum Transport {
    Tcp(TcpStream),
    #[cfg(feature = "tls-rustls")]
    TcpTls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls-rustls")]
            Transport::TcpTls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls-rustls")]
            Transport::TcpTls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls-rustls")]
            Transport::TcpTls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls-rustls")]
            Transport::TcpTls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

async fn with_deadline<F, T>(duration: Duration, timeout_error: Error, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error),
    }
}

/// Resolves the address. Kept separate from the connect deadline so DNS
/// failures report as `ResolveTimeout`.
pub(crate) async fn resolve(cfg: &Config, addr: &Address) -> Result<Vec<SocketAddr>> {
    let result = with_deadline(cfg.resolve_timeout, Error::ResolveTimeout, async {
        let endpoints = tokio::net::lookup_host((addr.host.as_str(), addr.port))
            .await
            .map_err(Error::from)?;
        Ok(endpoints.collect::<Vec<_>>())
    })
    .await;

    match &result {
        Ok(endpoints) => debug!(prefix = %cfg.log_prefix, address = %addr, count = endpoints.len(), "resolve ok"),
        Err(err) => warn!(prefix = %cfg.log_prefix, address = %addr, %err, "resolve failed"),
    }
    result
}

async fn connect_any(endpoints: &[SocketAddr]) -> Result<TcpStream> {
    let mut last_err: Error = io::Error::from(io::ErrorKind::AddrNotAvailable).into();
    for endpoint in endpoints {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err.into(),
        }
    }
    Err(last_err)
}

#[cfg(feature = "tls-rustls")]
fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(feature = "tls-rustls")]
async fn tls_handshake(cfg: &Config, addr: &Address, tcp: TcpStream) -> Result<Transport> {
    let server_name = rustls_pki_types::ServerName::try_from(addr.host.clone())
        .map_err(|_| Error::from(io::Error::from(io::ErrorKind::InvalidInput)))?;
    let result = with_deadline(cfg.ssl_handshake_timeout, Error::SslHandshakeTimeout, async {
        tls_connector()
            .connect(server_name, tcp)
            .await
            .map_err(Error::from)
    })
    .await;

    match &result {
        Ok(_) => debug!(prefix = %cfg.log_prefix, address = %addr, "TLS handshake ok"),
        Err(err) => warn!(prefix = %cfg.log_prefix, address = %addr, %err, "TLS handshake failed"),
    }
    result.map(|stream| Transport::TcpTls(Box::new(stream)))
}

/// Resolve + connect (+ optional TLS handshake) with the configured
/// per-stage deadlines.
pub(crate) async fn connect(cfg: &Config, addr: &Address) -> Result<Transport> {
    if let Some(path) = &cfg.unix_socket {
        if cfg.use_ssl {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unix_socket and use_ssl are mutually exclusive",
            )
            .into());
        }
        #[cfg(unix)]
        {
            let result = with_deadline(cfg.connect_timeout, Error::ConnectTimeout, async {
                UnixStream::connect(path).await.map_err(Error::from)
            })
            .await;
            match &result {
                Ok(_) => debug!(prefix = %cfg.log_prefix, path = %path.display(), "connected"),
                Err(err) => {
                    warn!(prefix = %cfg.log_prefix, path = %path.display(), %err, "connect failed")
                }
            }
            return result.map(Transport::Unix);
        }
        #[cfg(not(unix))]
        {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )
            .into());
        }
    }

    let endpoints = resolve(cfg, addr).await?;
    let tcp = {
        let result =
            with_deadline(cfg.connect_timeout, Error::ConnectTimeout, connect_any(&endpoints))
                .await;
        match &result {
            Ok(_) => debug!(prefix = %cfg.log_prefix, address = %addr, "connected"),
            Err(err) => warn!(prefix = %cfg.log_prefix, address = %addr, %err, "connect failed"),
        }
        result?
    };

    if cfg.use_ssl {
        #[cfg(feature = "tls-rustls")]
        {
            return tls_handshake(cfg, addr, tcp).await;
        }
        #[cfg(not(feature = "tls-rustls"))]
        {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "built without TLS support",
            )
            .into());
        }
    }
    Ok(Transport::Tcp(tcp))
}
