use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Probe pipe I/O failure, desync, or timeout awaiting a response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The pipe address could not be understood.
    #[error("Probe address format is \"tcp:<host>:<port>\" or \"unix:<path>\".")]
    InvalidAddress,

    /// The pipe endpoint could not be reached.
    #[error("Could not connect to probe endpoint: {0}.")]
    ConnectionFailed(#[source] std::io::Error),

    /// Reading from or writing to the pipe failed.
    #[error("Probe pipe I/O failed: {0}.")]
    Io(#[from] std::io::Error),

    /// The pipe was closed while a response was outstanding.
    #[error("Probe pipe closed by the remote end.")]
    Eof,

    /// The command/response discipline has been violated and the pipe contents
    /// can no longer be interpreted.
    #[error("Probe pipe desynchronized: {0}.")]
    Desynchronized(&'static str),
}

/// Full-duplex reliable byte stream to the probe hardware.
///
/// No framing is imposed by the transport. Commands are delivered in order and
/// responses match commands one-for-one; `flush` only bounds latency.
pub trait BytePipe {
    /// Queues bytes for transmission. The data is not guaranteed to reach the
    /// probe until [`BytePipe::flush`] or a receive operation.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Forces transmission of all queued bytes.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Receives exactly `size` bytes, flushing queued output first. Returns
    /// [`TransportError::Eof`] if the pipe closes before enough data arrives.
    fn recv(&mut self, size: usize) -> Result<Vec<u8>, TransportError>;

    /// Checks whether `size` bytes are available without blocking, flushing
    /// queued output first. Partially received data is retained for the next
    /// call, so interleaving `recv_poll` and `recv` is safe.
    fn recv_poll(&mut self, size: usize) -> Result<Option<Vec<u8>>, TransportError>;
}

enum NetStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl NetStream {
    fn set_nonblocking(&mut self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            NetStream::Tcp(stream) => stream.set_nonblocking(nonblocking),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        match self {
            NetStream::Tcp(stream) => stream.read(buffer),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.read(buffer),
        }
    }

    fn write_all(&mut self, buffer: &[u8]) -> std::io::Result<()> {
        match self {
            NetStream::Tcp(stream) => stream.write_all(buffer),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.write_all(buffer),
        }
    }
}

/// A probe pipe reached over a TCP or Unix domain socket, as exported by the
/// probe toolkit in network mode.
pub struct NetPipe {
    stream: NetStream,
    out_buffer: Vec<u8>,
    in_buffer: Vec<u8>,
}

impl NetPipe {
    /// Connects to `"tcp:<host>:<port>"` or `"unix:<path>"`.
    pub fn open(address: &str) -> Result<Self, TransportError> {
        let stream = match *address.splitn(2, ':').collect::<Vec<_>>() {
            ["tcp", addr] => {
                NetStream::Tcp(TcpStream::connect(addr).map_err(TransportError::ConnectionFailed)?)
            }
            #[cfg(unix)]
            ["unix", addr] => NetStream::Unix(
                UnixStream::connect(addr).map_err(TransportError::ConnectionFailed)?,
            ),
            _ => return Err(TransportError::InvalidAddress),
        };
        tracing::info!("opened probe pipe at {address}");
        Ok(NetPipe {
            stream,
            out_buffer: Vec::new(),
            in_buffer: Vec::new(),
        })
    }

    fn fill(&mut self, size: usize, block: bool) -> Result<bool, TransportError> {
        while self.in_buffer.len() < size {
            let mut buffer = vec![0; 65536];
            self.stream.set_nonblocking(!block)?;
            match self.stream.read(&mut buffer) {
                Ok(0) => return Err(TransportError::Eof),
                Ok(length) => {
                    tracing::trace!("recv: {}", hexdump(&buffer[..length]));
                    self.in_buffer.extend_from_slice(&buffer[..length]);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    debug_assert!(!block);
                    return Ok(false);
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Ok(true)
    }

    fn take(&mut self, size: usize) -> Vec<u8> {
        let mut data = self.in_buffer.split_off(size);
        std::mem::swap(&mut data, &mut self.in_buffer);
        data
    }
}

impl BytePipe for NetPipe {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.out_buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if !self.out_buffer.is_empty() {
            tracing::trace!("send: {}", hexdump(&self.out_buffer));
            self.stream.set_nonblocking(false)?;
            let out_buffer = std::mem::take(&mut self.out_buffer);
            self.stream.write_all(&out_buffer)?;
        }
        Ok(())
    }

    fn recv(&mut self, size: usize) -> Result<Vec<u8>, TransportError> {
        self.flush()?;
        self.fill(size, true)?;
        Ok(self.take(size))
    }

    fn recv_poll(&mut self, size: usize) -> Result<Option<Vec<u8>>, TransportError> {
        self.flush()?;
        if self.fill(size, false)? {
            Ok(Some(self.take(size)))
        } else {
            Ok(None)
        }
    }
}

pub(crate) fn hexdump(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut result = String::new();
    result.push('<');
    for byte in bytes {
        write!(&mut result, "{byte:02x}").unwrap();
    }
    result.push('>');
    result
}
