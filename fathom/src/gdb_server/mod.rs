//! GDB remote serial protocol server.
//!
//! Speaks `$<body>#<checksum>` packets over a TCP stream, dispatching the
//! usual q/Q/g/G/p/P/m/M/c/s/vCont/Z/z command set to a [`GdbTarget`]. Both
//! GDB and LLDB peers are supported, including LLDB's error-string dialect
//! and its byte-order deviation on register payloads.

mod target;

pub use target::{GdbTarget, InterruptFn, ARMV4T_TARGET_XML, MIPS32_TARGET_XML};

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use crate::probe::TransportError;
use crate::util::Endianness;
use crate::Error;

/// Errors produced by the GDB server itself (target errors are reported to
/// the peer in-protocol instead).
#[derive(Debug, thiserror::Error)]
pub enum GdbServerError {
    /// Socket I/O failed.
    #[error("GDB socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-packet.
    #[error("GDB client closed the connection")]
    Disconnected,

    /// The peer responded to a packet with something other than `+` or `-`.
    #[error("unrecognized acknowledgement {0:#04x}")]
    UnrecognizedAck(u8),
}

/// Which error reporting dialect the peer negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorDialect {
    /// Bare `Exx`.
    Plain,
    /// LLDB's `Exx;message`.
    Lldb,
    /// GDB's `E.message`.
    Gdb,
}

enum Response {
    Data(Vec<u8>),
    Failure {
        code: u8,
        message: String,
        fatal: bool,
    },
}

impl Response {
    fn ok() -> Response {
        Response::Data(b"OK".to_vec())
    }

    fn empty() -> Response {
        Response::Data(Vec::new())
    }

    fn error(code: u8, message: impl Into<String>) -> Response {
        Response::Failure {
            code,
            message: message.into(),
            fatal: false,
        }
    }
}

/// Serves GDB remote protocol connections one at a time, forever.
///
/// After a debugger disconnects while the target is halted, the target is
/// detached so it keeps running between debug sessions.
pub fn serve(listener: TcpListener, target: &mut dyn GdbTarget) -> Result<(), Error> {
    loop {
        let (stream, peer) = listener.accept().map_err(GdbServerError::Io)?;
        tracing::info!("GDB connection from {peer}");
        run_connection(stream, target)?;
        if !target.is_running() {
            target.detach()?;
        }
    }
}

/// Runs one GDB remote protocol session over an accepted stream. Returns
/// normally when the peer disconnects; fatal target errors propagate.
pub fn run_connection(stream: TcpStream, target: &mut dyn GdbTarget) -> Result<(), Error> {
    let mut connection = Connection {
        stream,
        no_ack_mode: false,
        dialect: ErrorDialect::Plain,
        quirk_byteorder: false,
    };
    match connection.run(target) {
        Ok(()) | Err(Error::GdbServer(GdbServerError::Disconnected)) => Ok(()),
        Err(error) => Err(error),
    }
}

struct Connection {
    stream: TcpStream,
    no_ack_mode: bool,
    dialect: ErrorDialect,
    quirk_byteorder: bool,
}

impl Connection {
    fn recv_byte(&mut self) -> Result<u8, GdbServerError> {
        let mut byte = [0];
        self.stream.set_nonblocking(false)?;
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(GdbServerError::Disconnected),
                Ok(_) => return Ok(byte[0]),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn recv_until(&mut self, delimiter: u8) -> Result<Vec<u8>, GdbServerError> {
        let mut data = Vec::new();
        loop {
            let byte = self.recv_byte()?;
            if byte == delimiter {
                return Ok(data);
            }
            data.push(byte);
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), GdbServerError> {
        self.stream.write_all(data)?;
        Ok(())
    }

    fn run(&mut self, target: &mut dyn GdbTarget) -> Result<(), Error> {
        loop {
            loop {
                match self.recv_byte().map_err(Error::GdbServer)? {
                    b'$' => break,
                    b'+' | 0x03 => continue,
                    junk => {
                        tracing::warn!("received junk: {junk:#04x}");
                    }
                }
            }

            let command = self.recv_until(b'#').map_err(Error::GdbServer)?;
            let checksum_text = [
                self.recv_byte().map_err(Error::GdbServer)?,
                self.recv_byte().map_err(Error::GdbServer)?,
            ];
            let checksum = parse_hex(&checksum_text).unwrap_or(u64::MAX);
            if packet_checksum(&command) as u64 != checksum {
                tracing::error!("invalid checksum for command {:?}", printable(&command));
            }
            if !self.no_ack_mode {
                self.send(b"+").map_err(Error::GdbServer)?;
            }

            tracing::debug!("recv {:?}", printable(&command));

            let response = if command == b"QStartNoAckMode" {
                self.no_ack_mode = true;
                Response::ok()
            } else {
                match self.dispatch(&command, target) {
                    Ok(response) => response,
                    Err(error) if matches!(error, Error::NotImplemented(_)) => {
                        Response::error(98, "not implemented")
                    }
                    Err(error) if error.is_fatal() => Response::Failure {
                        code: 99,
                        message: error.to_string(),
                        fatal: true,
                    },
                    Err(error) => Response::error(0, error.to_string()),
                }
            };

            let (body, fatal) = match response {
                Response::Data(body) => (body, false),
                Response::Failure {
                    code,
                    message,
                    fatal,
                } => {
                    if fatal {
                        tracing::error!(
                            "command {:?} caused an unrecoverable error: {message}",
                            printable(&command)
                        );
                    } else {
                        tracing::warn!(
                            "command {:?} caused an error: {message}",
                            printable(&command)
                        );
                    }
                    let body = match self.dialect {
                        ErrorDialect::Plain => format!("E{code:02x}").into_bytes(),
                        ErrorDialect::Lldb => format!("E{code:02x};{message}").into_bytes(),
                        ErrorDialect::Gdb => format!("E.{message}").into_bytes(),
                    };
                    (body, fatal)
                }
            };

            loop {
                tracing::debug!("send {:?}", printable(&body));
                let mut packet = Vec::with_capacity(body.len() + 4);
                packet.push(b'$');
                packet.extend_from_slice(&body);
                packet.push(b'#');
                packet.extend_from_slice(format!("{:02x}", packet_checksum(&body)).as_bytes());
                self.send(&packet).map_err(Error::GdbServer)?;

                if self.no_ack_mode {
                    break;
                }
                let mut ack = self.recv_byte().map_err(Error::GdbServer)?;
                while ack == 0x03 {
                    ack = self.recv_byte().map_err(Error::GdbServer)?;
                }
                match ack {
                    b'+' => break,
                    b'-' => continue,
                    other => {
                        tracing::error!("unrecognized acknowledgement {other:#04x}");
                        return Err(GdbServerError::UnrecognizedAck(other).into());
                    }
                }
            }

            if fatal {
                return Ok(());
            }
        }
    }

    fn byteorder(&self, target: &dyn GdbTarget) -> Endianness {
        if self.quirk_byteorder {
            // LLDB transfers register bytes in its own host byte order,
            // contrary to the protocol specification; assume it runs on the
            // same host as this server.
            Endianness::host()
        } else {
            target.endianness()
        }
    }

    fn dispatch(
        &mut self,
        command: &[u8],
        target: &mut dyn GdbTarget,
    ) -> Result<Response, Error> {
        let word_size = target.word_size();

        // (lldb) "Send me human-readable error messages."
        if command == b"QEnableErrorStrings" {
            self.dialect = ErrorDialect::Lldb;
            return Ok(Response::ok());
        }

        // (lldb) "What are the properties of the machine the target runs on?"
        if command == b"qHostInfo" {
            if target.endianness() != Endianness::host() {
                self.quirk_byteorder = true;
                tracing::warn!(
                    "enabling workaround for using LLDB with a target of differing endianness; \
                     expect brokenness"
                );
            }
            let info = format!(
                "ptrsize:{};endian:{};triple:{};",
                word_size,
                target.endianness(),
                target.triple()
            );
            return Ok(Response::Data(info.into_bytes()));
        }

        // "I support these features. Which features do you support?"
        if let Some(rest) = command.strip_prefix(b"qSupported") {
            if rest
                .split(|&byte| byte == b';' || byte == b':')
                .any(|feature| feature == b"error-message+")
            {
                self.dialect = ErrorDialect::Gdb;
            }
            return Ok(Response::Data(
                b"vContSupported+;qXfer:features:read+".to_vec(),
            ));
        }

        // "Which resume actions do you support?"
        //
        // Without `C`, GDB refuses to use `vCont` at all, and then does not
        // use single-stepping either; similarly `S` must be declared for `s`
        // to be used. Both are rejected when actually sent.
        if command == b"vCont?" {
            return Ok(Response::Data(b"vCont;c;C;s;S".to_vec()));
        }
        if command.starts_with(b"vCont;C") || command.starts_with(b"vCont;S") {
            return Ok(Response::error(97, "unsupported vCont command"));
        }

        // "Tell me everything you know about the target features."
        if let Some(rest) = command.strip_prefix(b"qXfer:features:read:") {
            let text = String::from_utf8_lossy(rest);
            let (annex, range) = text
                .split_once(':')
                .ok_or(Error::NotImplemented("malformed qXfer"))?;
            let (offset, length) = range
                .split_once(',')
                .ok_or(Error::NotImplemented("malformed qXfer"))?;
            let offset = usize::from_str_radix(offset, 16).unwrap_or(0);
            let length = usize::from_str_radix(length, 16).unwrap_or(0);
            for (name, data) in target.features() {
                if name == annex {
                    let end = (offset + length).min(data.len());
                    let chunk = if offset < data.len() {
                        &data[offset..end]
                    } else {
                        &data[..0]
                    };
                    let mut body =
                        vec![if end >= data.len() { b'l' } else { b'm' }];
                    body.extend(binary_escape(chunk));
                    return Ok(Response::Data(body));
                }
            }
            return Ok(Response::error(1, format!("unsupported annex {annex:?}")));
        }

        // "Am I attached to a new process, or to an existing one?"
        //
        // Not actually a process, but "existing" makes the debugger detach
        // when it quits instead of killing the target.
        if command == b"qAttached" {
            return Ok(Response::Data(b"1".to_vec()));
        }

        // "Why is the target stopped?"
        //
        // The debugger expects the target to already be stopped when it
        // connects, and there is no "not stopped yet" reply. Targets are only
        // stopped when they positively have to be.
        if command == b"?" {
            if target.is_running() {
                target.stop()?;
            }
            return Ok(Response::Data(b"T05thread:0;".to_vec()));
        }

        // "Resume target."
        if command == b"c" || command == b"vCont;c" {
            let stream = &mut self.stream;
            let mut interrupt = move || -> Result<bool, TransportError> {
                stream.set_nonblocking(true)?;
                let mut byte = [0];
                let result = match stream.read(&mut byte) {
                    Ok(0) => Err(TransportError::Eof),
                    Ok(_) => Ok(byte[0] == 0x03),
                    Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(false),
                    Err(error) => Err(error.into()),
                };
                stream.set_nonblocking(false)?;
                result
            };
            target.resume(&mut interrupt)?;
            return Ok(Response::Data(b"T05thread:0;".to_vec()));
        }

        // "Single-step target."
        if command == b"s" || command.starts_with(b"vCont;s") {
            target.single_step()?;
            return Ok(Response::Data(b"T05thread:0;".to_vec()));
        }

        // "Detach from target."
        if command == b"D" {
            target.detach()?;
            return Ok(Response::ok());
        }

        // "Get all registers of the target."
        if command == b"g" {
            let byteorder = self.byteorder(target);
            let mut response = Vec::new();
            for value in target.get_registers()? {
                response.extend(byteorder.word_to_bytes(value, word_size));
            }
            return Ok(Response::Data(to_hex(&response)));
        }

        // "Set all registers of the target."
        if let Some(rest) = command.strip_prefix(b"G") {
            let byteorder = self.byteorder(target);
            let bytes = from_hex(rest).ok_or(Error::NotImplemented("malformed G packet"))?;
            let values: Vec<u64> = bytes
                .chunks_exact(word_size)
                .map(|chunk| byteorder.word_from_bytes(chunk))
                .collect();
            target.set_registers(&values)?;
            return Ok(Response::ok());
        }

        // "Get specific register of the target."
        if let Some(rest) = command.strip_prefix(b"p") {
            let byteorder = self.byteorder(target);
            let number =
                parse_hex(rest).ok_or(Error::NotImplemented("malformed p packet"))? as usize;
            let value = target.get_register(number)?;
            return Ok(Response::Data(to_hex(
                &byteorder.word_to_bytes(value, word_size),
            )));
        }

        // "Set specific register of the target."
        if let Some(rest) = command.strip_prefix(b"P") {
            let byteorder = self.byteorder(target);
            let text = String::from_utf8_lossy(rest);
            let (number, value) = text
                .split_once('=')
                .ok_or(Error::NotImplemented("malformed P packet"))?;
            let number = usize::from_str_radix(number, 16)
                .map_err(|_| Error::NotImplemented("malformed P packet"))?;
            let bytes =
                from_hex(value.as_bytes()).ok_or(Error::NotImplemented("malformed P packet"))?;
            target.set_register(number, byteorder.word_from_bytes(&bytes))?;
            return Ok(Response::ok());
        }

        // "Read specified memory range of the target."
        if let Some(rest) = command.strip_prefix(b"m") {
            let text = String::from_utf8_lossy(rest);
            let (address, length) = text
                .split_once(',')
                .ok_or(Error::NotImplemented("malformed m packet"))?;
            let address = u64::from_str_radix(address, 16)
                .map_err(|_| Error::NotImplemented("malformed m packet"))?;
            let length = usize::from_str_radix(length, 16)
                .map_err(|_| Error::NotImplemented("malformed m packet"))?;
            let data = target.read_memory(address, length)?;
            return Ok(Response::Data(to_hex(&data)));
        }

        // "Write specified memory range of the target."
        if let Some(rest) = command.strip_prefix(b"M") {
            let text = String::from_utf8_lossy(rest);
            let (location, data) = text
                .split_once(':')
                .ok_or(Error::NotImplemented("malformed M packet"))?;
            let (address, _length) = location
                .split_once(',')
                .ok_or(Error::NotImplemented("malformed M packet"))?;
            let address = u64::from_str_radix(address, 16)
                .map_err(|_| Error::NotImplemented("malformed M packet"))?;
            let data =
                from_hex(data.as_bytes()).ok_or(Error::NotImplemented("malformed M packet"))?;
            target.write_memory(address, &data)?;
            return Ok(Response::ok());
        }

        // Breakpoints. An unsupported kind produces an empty response, which
        // tells the debugger to use a different mechanism.
        if command.len() > 2 && (command[0] == b'Z' || command[0] == b'z') {
            let text = String::from_utf8_lossy(&command[3..]);
            let (address, kind) = text
                .split_once(',')
                .ok_or(Error::NotImplemented("malformed breakpoint packet"))?;
            let address = u64::from_str_radix(address, 16)
                .map_err(|_| Error::NotImplemented("malformed breakpoint packet"))?;
            let kind = usize::from_str_radix(kind, 16)
                .map_err(|_| Error::NotImplemented("malformed breakpoint packet"))?;
            let result = match &command[..2] {
                b"Z0" => target.set_software_breakpoint(address, kind),
                b"z0" => target.clear_software_breakpoint(address, kind),
                b"Z1" => target.set_hardware_breakpoint(address, kind),
                b"z1" => target.clear_hardware_breakpoint(address, kind),
                _ => return Ok(Response::empty()),
            };
            return match result {
                Ok(()) => Ok(Response::ok()),
                Err(Error::NotImplemented(_)) => Ok(Response::empty()),
                Err(error) => Err(error),
            };
        }

        // "Execute this monitor command."
        if let Some(rest) = command.strip_prefix(b"qRcmd,") {
            const ENABLE_VAR: &str = "GLASGOW_GDB_MONITOR";
            const ENABLE_VALUE: &str = "unsafe";
            if std::env::var(ENABLE_VAR).as_deref() != Ok(ENABLE_VALUE) {
                return Ok(Response::error(
                    95,
                    format!(
                        "to enable GDB monitor commands, set {ENABLE_VAR}={ENABLE_VALUE} in the \
                         GDB server environment"
                    ),
                ));
            }
            let text = from_hex(rest).ok_or(Error::NotImplemented("malformed qRcmd"))?;
            match text.as_slice() {
                b"halt" => {
                    if target.is_running() {
                        target.stop()?;
                    }
                    return Ok(Response::ok());
                }
                _ => return Ok(Response::error(96, "unknown monitor command")),
            }
        }

        Ok(Response::empty())
    }
}

fn packet_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

fn binary_escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        if matches!(byte, b'#' | b'$' | b'}' | b'*') {
            escaped.push(0x7d);
            escaped.push(byte ^ 0x20);
        } else {
            escaped.push(byte);
        }
    }
    escaped
}

fn to_hex(data: &[u8]) -> Vec<u8> {
    let mut text = Vec::with_capacity(data.len() * 2);
    for byte in data {
        text.extend(format!("{byte:02x}").into_bytes());
    }
    text
}

fn from_hex(text: &[u8]) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    let mut data = Vec::with_capacity(text.len() / 2);
    for pair in text.chunks_exact(2) {
        let text = std::str::from_utf8(pair).ok()?;
        data.push(u8::from_str_radix(text, 16).ok()?);
    }
    Some(data)
}

fn parse_hex(text: &[u8]) -> Option<u64> {
    u64::from_str_radix(std::str::from_utf8(text).ok()?, 16).ok()
}

fn printable(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn checksum_matches_protocol() {
        // "$g#67" is the canonical get-registers packet.
        assert_eq!(packet_checksum(b"g"), 0x67);
        assert_eq!(packet_checksum(b"OK"), 0x9a);
    }

    #[test]
    fn escape_reserved_bytes() {
        assert_eq!(binary_escape(b"a#b"), b"a}\x03b".to_vec());
        assert_eq!(binary_escape(b"}"), b"}]".to_vec());
        assert_eq!(binary_escape(b"plain"), b"plain".to_vec());
    }

    #[test]
    fn hex_round_trip() {
        assert_eq!(to_hex(&[0xde, 0xad, 0xbe, 0xef]), b"deadbeef".to_vec());
        assert_eq!(from_hex(b"deadbeef"), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(from_hex(b"abc"), None);
        assert_eq!(from_hex(b"zz"), None);
        assert_eq!(parse_hex(b"1f"), Some(0x1f));
    }
}
