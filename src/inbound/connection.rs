use std::{pin::Pin, sync::Arc, task::ready};

use anyhow::{anyhow, Error};
use futures::Future;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{rustls::ServerConfig, server::TlsStream, Accept, TlsAcceptor};

use crate::xmpp::stream::Connection;

/// The two transports a client connection can be on. The TLS variant
/// wraps the same TCP socket the plaintext variant held; there is no way
/// back.
enum Socket {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

pub struct TcpConnection {
    socket: Socket,
    tls_config: Option<Arc<ServerConfig>>,
}

impl TcpConnection {
    /// `tls_config` present means STARTTLS will be offered; the config is
    /// the one instance shared by every connection.
    pub fn new(socket: TcpStream, tls_config: Option<Arc<ServerConfig>>) -> Self {
        TcpConnection {
            socket: Socket::Plain(socket),
            tls_config,
        }
    }
}

impl Connection for TcpConnection {
    type Upgrade = TcpConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let config = self
            .tls_config
            .clone()
            .ok_or_else(|| anyhow!("TLS is not configured"))?;

        match self.socket {
            Socket::Plain(socket) => {
                let accept = TlsAcceptor::from(config).accept(socket);
                Ok(TcpConnectionUpgrade {
                    accept,
                    tls_config: self.tls_config,
                })
            }
            Socket::Tls(_) => Err(anyhow!("connection is already secure")),
        }
    }

    fn is_starttls_allowed(&self) -> bool {
        self.tls_config.is_some() && matches!(self.socket, Socket::Plain(_))
    }

    fn is_secure(&self) -> bool {
        matches!(self.socket, Socket::Tls(_))
    }

    fn is_authenticated(&self) -> bool {
        match &self.socket {
            Socket::Plain(_) => false,
            Socket::Tls(socket) => socket.get_ref().1.peer_certificates().is_some(),
        }
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_shutdown(cx),
        }
    }
}

/// Resolves once the rustls server handshake on the underlying socket is
/// done. The handshake spans however many readiness events it needs; the
/// caller just awaits.
pub struct TcpConnectionUpgrade {
    accept: Accept<TcpStream>,
    tls_config: Option<Arc<ServerConfig>>,
}

impl Future for TcpConnectionUpgrade {
    type Output = Result<TcpConnection, Error>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let tls_stream = ready!(Pin::new(&mut self.accept).poll(cx))?;
        let connection = TcpConnection {
            socket: Socket::Tls(tls_stream),
            tls_config: self.tls_config.take(),
        };
        std::task::Poll::Ready(Ok(connection))
    }
}
