use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::trace;

use crate::config::EngineConfig;

/// TLS material for both connection directions. Certificate/key management is the
///  caller's concern - this engine only applies whatever rustls configs it is handed.
pub struct TlsContext {
    pub client_config: Arc<ClientConfig>,
    pub server_config: Arc<ServerConfig>,
}

impl TlsContext {
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

/// Uniform I/O surface over a plain or TLS socket. Framing code upstream reads and
///  writes this without knowing whether record unwrapping happens underneath.
pub enum FilterStream {
    Plain(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl FilterStream {
    /// Wrap an initiator-side socket, running the TLS client handshake when configured.
    pub async fn wrap_initiator(stream: TcpStream, tls: Option<&TlsContext>, peer_ip: IpAddr) -> io::Result<FilterStream> {
        match tls {
            None => Ok(FilterStream::Plain(stream)),
            Some(tls) => {
                trace!("running TLS client handshake with {:?}", peer_ip);
                let domain = ServerName::IpAddress(peer_ip.into());
                let tls_stream = tls.connector().connect(domain, stream).await?;
                Ok(FilterStream::TlsClient(Box::new(tls_stream)))
            }
        }
    }

    /// Wrap an accepted socket, running the TLS server handshake when configured.
    pub async fn wrap_acceptor(stream: TcpStream, tls: Option<&TlsContext>) -> io::Result<FilterStream> {
        match tls {
            None => Ok(FilterStream::Plain(stream)),
            Some(tls) => {
                trace!("running TLS server handshake");
                let tls_stream = tls.acceptor().accept(stream).await?;
                Ok(FilterStream::TlsServer(Box::new(tls_stream)))
            }
        }
    }

    pub fn split(self) -> (FilterReader, FilterWriter) {
        tokio::io::split(self)
    }
}

pub type FilterReader = ReadHalf<FilterStream>;
pub type FilterWriter = WriteHalf<FilterStream>;

impl AsyncRead for FilterStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FilterStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            FilterStream::TlsClient(s) => Pin::new(&mut **s).poll_read(cx, buf),
            FilterStream::TlsServer(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FilterStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FilterStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            FilterStream::TlsClient(s) => Pin::new(&mut **s).poll_write(cx, buf),
            FilterStream::TlsServer(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FilterStream::Plain(s) => Pin::new(s).poll_flush(cx),
            FilterStream::TlsClient(s) => Pin::new(&mut **s).poll_flush(cx),
            FilterStream::TlsServer(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FilterStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            FilterStream::TlsClient(s) => Pin::new(&mut **s).poll_shutdown(cx),
            FilterStream::TlsServer(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// Socket options for the initiating (mostly writing) side: full-size send buffer,
///  shrunk receive buffer - replies on this socket are small acks.
pub fn configure_initiator_socket(stream: &TcpStream, config: &EngineConfig) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_keepalive(true)?;
    sock.set_send_buffer_size(config.tcp_buffer_size)?;
    sock.set_recv_buffer_size(config.small_buffer_size)?;
    Ok(())
}

/// Socket options for the accepting (mostly reading) side: the mirror image of the
///  initiator settings.
pub fn configure_acceptor_socket(stream: &TcpStream, config: &EngineConfig) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_keepalive(true)?;
    sock.set_recv_buffer_size(config.tcp_buffer_size)?;
    sock.set_send_buffer_size(config.small_buffer_size)?;
    Ok(())
}
