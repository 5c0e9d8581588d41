use std::{io, net::SocketAddr, path::Path};

use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split},
    net::{ListenerOpts, TcpListener, TcpStream},
    BufResult,
};

use crate::config::ListenerConfig;

// Forwards a call to whichever socket kind backs the value.
macro_rules! each_socket {
    ($value:expr, $ty:ident, $inner:ident => $body:expr) => {
        match $value {
            $ty::Tcp($inner) => $body,
            #[cfg(unix)]
            $ty::Unix($inner) => $body,
        }
    };
}

pub enum ListenerBuilder {
    Tcp(SocketAddr, ListenerOpts),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl ListenerBuilder {
    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> ListenerBuilder {
        Self::Tcp(addr, opts)
    }

    /// Binds the socket file right away; a stale file left by a previous run is removed.
    #[cfg(unix)]
    pub fn bind_unix<P: AsRef<Path>>(path: P) -> io::Result<ListenerBuilder> {
        let _ = std::fs::remove_file(path.as_ref());
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        // The async listener is built from the raw fd, so it must not block.
        if monoio::utils::is_legacy() {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::Unix(listener))
    }

    pub fn build(&self) -> io::Result<Listener> {
        match self {
            ListenerBuilder::Tcp(addr, opts) => {
                TcpListener::bind_with_config(addr, opts).map(Listener::Tcp)
            }
            #[cfg(unix)]
            ListenerBuilder::Unix(listener) => {
                monoio::net::UnixListener::from_std(listener.try_clone()?).map(Listener::Unix)
            }
        }
    }
}

impl TryFrom<&ListenerConfig> for ListenerBuilder {
    type Error = io::Error;

    fn try_from(config: &ListenerConfig) -> Result<Self, Self::Error> {
        match config {
            ListenerConfig::Socket(addr) => Ok(Self::bind_tcp(*addr, ListenerOpts::default())),
            #[cfg(unix)]
            ListenerConfig::Unix(path) => Self::bind_unix(path),
            #[cfg(not(unix))]
            ListenerConfig::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
}

impl Listener {
    /// Bound address for TCP listeners; `None` for unix sockets.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }
}

impl Stream for Listener {
    type Item = io::Result<(AcceptedStream, AcceptedAddr)>;

    async fn next(&mut self) -> Option<Self::Item> {
        let accepted = match self {
            Listener::Tcp(l) => l
                .next()
                .await?
                .map(|(io, addr)| (AcceptedStream::Tcp(io), AcceptedAddr::Tcp(addr))),
            #[cfg(unix)]
            Listener::Unix(l) => l
                .next()
                .await?
                .map(|(io, addr)| (AcceptedStream::Unix(io), AcceptedAddr::Unix(addr))),
        };
        Some(accepted)
    }
}

pub enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

unsafe impl Split for AcceptedStream {}

#[derive(Debug, Clone)]
pub enum AcceptedAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(monoio::net::unix::SocketAddr),
}

impl From<SocketAddr> for AcceptedAddr {
    fn from(value: SocketAddr) -> Self {
        Self::Tcp(value)
    }
}

impl AsyncReadRent for AcceptedStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        each_socket!(self, AcceptedStream, inner => inner.read(buf).await)
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        each_socket!(self, AcceptedStream, inner => inner.readv(buf).await)
    }
}

impl AsyncWriteRent for AcceptedStream {
    #[inline]
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        each_socket!(self, AcceptedStream, inner => inner.write(buf).await)
    }

    #[inline]
    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        each_socket!(self, AcceptedStream, inner => inner.writev(buf_vec).await)
    }

    #[inline]
    async fn flush(&mut self) -> io::Result<()> {
        each_socket!(self, AcceptedStream, inner => inner.flush().await)
    }

    #[inline]
    async fn shutdown(&mut self) -> io::Result<()> {
        each_socket!(self, AcceptedStream, inner => inner.shutdown().await)
    }
}
