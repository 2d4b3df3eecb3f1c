use std::fmt;
use std::io::{self, Read, Result, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use connstring::ServerAddress;
use settings::ServerSettings;

/// Socket-level options applied to every new connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    /// `None` leaves reads and writes blocking indefinitely.
    pub socket_timeout: Option<Duration>,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl<'a> From<&'a ServerSettings> for SocketOptions {
    fn from(settings: &ServerSettings) -> SocketOptions {
        let socket_timeout = if settings.socket_timeout == Duration::from_millis(0) {
            None
        } else {
            Some(settings.socket_timeout)
        };

        SocketOptions {
            connect_timeout: settings.connect_timeout,
            socket_timeout: socket_timeout,
            receive_buffer_size: settings.tcp_receive_buffer_size,
            send_buffer_size: settings.tcp_send_buffer_size,
        }
    }
}

/// A transport that is neither a plain TCP socket nor known to this crate.
pub trait ReadWrite: Read + Write + Send {
    /// Closes the transport. Further reads and writes should fail.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type ConnectFn = dyn Fn(&ServerAddress, &SocketOptions) -> Result<Stream> + Send + Sync;

/// Encapsulates the functionality for how to connect to the server.
#[derive(Clone)]
pub enum StreamConnector {
    /// Connect to the server through a regular TCP stream with Nagle
    /// disabled.
    Tcp,
    /// Connect through an embedder-supplied transport.
    Custom(Arc<ConnectFn>),
}

impl Default for StreamConnector {
    fn default() -> Self {
        StreamConnector::Tcp
    }
}

impl fmt::Debug for StreamConnector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StreamConnector::Tcp => f.write_str("Tcp"),
            StreamConnector::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl StreamConnector {
    pub fn custom<F>(connect: F) -> StreamConnector
        where F: Fn(&ServerAddress, &SocketOptions) -> Result<Stream> + Send + Sync + 'static
    {
        StreamConnector::Custom(Arc::new(connect))
    }

    pub fn connect(&self, address: &ServerAddress, options: &SocketOptions) -> Result<Stream> {
        match *self {
            StreamConnector::Tcp => connect_tcp(address, options).map(Stream::Tcp),
            StreamConnector::Custom(ref connect) => connect(address, options),
        }
    }
}

// Tries each resolved address in turn and returns the first socket that
// connects.
fn connect_tcp(address: &ServerAddress, options: &SocketOptions) -> Result<TcpStream> {
    let mut last_err = None;

    for addr in address.resolve()? {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.set_recv_buffer_size(options.receive_buffer_size)?;
        socket.set_send_buffer_size(options.send_buffer_size)?;

        let connected = if options.connect_timeout == Duration::from_millis(0) {
            socket.connect(&addr.into())
        } else {
            socket.connect_timeout(&addr.into(), options.connect_timeout)
        };

        match connected {
            Ok(()) => {
                socket.set_read_timeout(options.socket_timeout)?;
                socket.set_write_timeout(options.socket_timeout)?;
                return Ok(TcpStream::from(socket));
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("could not connect to {}", address))
    }))
}

pub enum Stream {
    Tcp(TcpStream),
    Custom(Box<dyn ReadWrite>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.read(buf),
            Stream::Custom(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.write(buf),
            Stream::Custom(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match *self {
            Stream::Tcp(ref mut s) => s.flush(),
            Stream::Custom(ref mut s) => s.flush(),
        }
    }
}

impl Stream {
    pub fn shutdown(&mut self) -> Result<()> {
        match *self {
            Stream::Tcp(ref stream) => stream.shutdown(Shutdown::Both),
            Stream::Custom(ref mut stream) => stream.shutdown(),
        }
    }
}
