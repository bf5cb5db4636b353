use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};
#[cfg(unix)]
use std::path::Path;

/// The abstract secure-stream surface. A TLS backend plugs in by implementing
/// this; nothing in the core depends on how the bytes are protected.
pub trait SecureLink: Read + Write + Send {
    fn shutdown_link(&mut self, how: Shutdown) -> io::Result<()>;
}

/// A listening endpoint the broker or exec server accepts from.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    pub fn bind_tcp(addr: SocketAddr) -> io::Result<Listener> {
        TcpListener::bind(addr).map(Listener::Tcp)
    }

    #[cfg(unix)]
    pub fn bind_unix(path: &Path) -> io::Result<Listener> {
        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(path);
        UnixListener::bind(path).map(Listener::Unix)
    }

    /// Accepts one pending connection. The address is present only for IP
    /// endpoints; unix peers bypass address filtering.
    pub fn accept(&self) -> io::Result<(Connection, Option<IpAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((Connection::Tcp(stream), Some(addr.ip())))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok((Connection::Unix(stream), None))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{}", addr),
                Err(_) => "tcp://?".to_owned(),
            },
            #[cfg(unix)]
            Listener::Unix(listener) => match listener.local_addr() {
                Ok(addr) => format!("unix://{:?}", addr),
                Err(_) => "unix://?".to_owned(),
            },
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.register(registry, token, interests),
            #[cfg(unix)]
            Listener::Unix(listener) => listener.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.reregister(registry, token, interests),
            #[cfg(unix)]
            Listener::Unix(listener) => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.deregister(registry),
            #[cfg(unix)]
            Listener::Unix(listener) => listener.deregister(registry),
        }
    }
}

/// One accepted byte stream.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            Connection::Tcp(stream) => stream.peer_addr().ok().map(|a| a.ip()),
            #[cfg(unix)]
            Connection::Unix(_) => None,
        }
    }

    pub fn peer_describe(&self) -> String {
        match self {
            Connection::Tcp(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_owned()),
            #[cfg(unix)]
            Connection::Unix(_) => "unix-peer".to_owned(),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.shutdown(how),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.shutdown(how),
        }
    }

    /// Pending socket error, for the health-check sweep.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Connection::Tcp(stream) => stream.take_error(),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.take_error(),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.flush(),
        }
    }
}

impl Source for Connection {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.register(registry, token, interests),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.reregister(registry, token, interests),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.deregister(registry),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.deregister(registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct LoopLink {
        buffered: VecDeque<u8>,
        closed: bool,
    }

    impl Read for LoopLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.buffered.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.buffered.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for LoopLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.buffered.extend(buf.iter().copied());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SecureLink for LoopLink {
        fn shutdown_link(&mut self, _how: Shutdown) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn test_secure_link_is_object_safe() {
        let mut link: Box<dyn SecureLink> = Box::new(LoopLink {
            buffered: VecDeque::new(),
            closed: false,
        });

        link.write_all(b"handshake").unwrap();
        let mut back = [0u8; 9];
        link.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"handshake");

        link.shutdown_link(Shutdown::Write).unwrap();
        assert!(link.write(b"x").is_err());
    }

    #[test]
    fn test_tcp_listener_accept_would_block_when_idle() {
        let listener = Listener::bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(listener.describe().starts_with("tcp://127.0.0.1"));
    }
}
