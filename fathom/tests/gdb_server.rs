//! GDB remote serial protocol server exercised over a loopback socket.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use fathom::gdb_server::{run_connection, GdbTarget, InterruptFn, ARMV4T_TARGET_XML};
use fathom::util::Endianness;
use fathom::Error;

use pretty_assertions::assert_eq;

struct StubTarget {
    running: bool,
    regs: Vec<u64>,
    memory: Vec<u8>,
    hardware_breakpoints: Vec<(u64, usize)>,
}

impl StubTarget {
    fn new() -> Self {
        StubTarget {
            running: true,
            regs: (0..17).map(|index| index as u64 * 0x10).collect(),
            memory: vec![0; 0x100],
            hardware_breakpoints: Vec::new(),
        }
    }
}

impl GdbTarget for StubTarget {
    fn word_size(&self) -> usize {
        4
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn triple(&self) -> &'static str {
        "armv4t-none-eabi"
    }

    fn features(&self) -> Vec<(&'static str, &'static [u8])> {
        vec![("target.xml", ARMV4T_TARGET_XML)]
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.running = false;
        Ok(())
    }

    fn resume(&mut self, _interrupt: InterruptFn<'_>) -> Result<(), Error> {
        // Halt again immediately, as if a breakpoint fired at once.
        self.running = false;
        Ok(())
    }

    fn single_step(&mut self) -> Result<(), Error> {
        self.regs[15] += 4;
        Ok(())
    }

    fn detach(&mut self) -> Result<(), Error> {
        self.running = true;
        Ok(())
    }

    fn get_registers(&mut self) -> Result<Vec<u64>, Error> {
        Ok(self.regs.clone())
    }

    fn set_registers(&mut self, values: &[u64]) -> Result<(), Error> {
        self.regs = values.to_vec();
        Ok(())
    }

    fn get_register(&mut self, number: usize) -> Result<u64, Error> {
        self.regs
            .get(number)
            .copied()
            .ok_or(Error::NotImplemented("unsupported register number"))
    }

    fn set_register(&mut self, number: usize, value: u64) -> Result<(), Error> {
        *self
            .regs
            .get_mut(number)
            .ok_or(Error::NotImplemented("unsupported register number"))? = value;
        Ok(())
    }

    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>, Error> {
        let address = address as usize;
        Ok(self.memory[address..address + length].to_vec())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let address = address as usize;
        self.memory[address..address + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn set_software_breakpoint(&mut self, _address: u64, _kind: usize) -> Result<(), Error> {
        Err(Error::NotImplemented("unsupported breakpoint kind"))
    }

    fn clear_software_breakpoint(&mut self, _address: u64, _kind: usize) -> Result<(), Error> {
        Err(Error::NotImplemented("unsupported breakpoint kind"))
    }

    fn set_hardware_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error> {
        self.hardware_breakpoints.push((address, kind));
        Ok(())
    }

    fn clear_hardware_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error> {
        self.hardware_breakpoints
            .retain(|&breakpoint| breakpoint != (address, kind));
        Ok(())
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn read_byte(&mut self) -> u8 {
        let mut byte = [0];
        self.stream.read_exact(&mut byte).unwrap();
        byte[0]
    }

    /// Sends a command packet and returns the response body.
    fn exchange(&mut self, body: &str) -> String {
        let checksum = body
            .bytes()
            .fold(0u8, |sum, byte| sum.wrapping_add(byte));
        self.stream
            .write_all(format!("${body}#{checksum:02x}").as_bytes())
            .unwrap();
        // The server acknowledges the command first.
        assert_eq!(self.read_byte(), b'+');
        // Then it sends the response packet.
        assert_eq!(self.read_byte(), b'$');
        let mut response = Vec::new();
        loop {
            match self.read_byte() {
                b'#' => break,
                byte => response.push(byte),
            }
        }
        let _checksum = [self.read_byte(), self.read_byte()];
        self.stream.write_all(b"+").unwrap();
        String::from_utf8(response).unwrap()
    }
}

fn with_session(test: impl FnOnce(&mut Client)) -> StubTarget {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let mut target = StubTarget::new();
        let (stream, _) = listener.accept().unwrap();
        run_connection(stream, &mut target).unwrap();
        target
    });

    let mut client = Client {
        stream: TcpStream::connect(address).unwrap(),
    };
    test(&mut client);
    drop(client);
    server.join().unwrap()
}

#[test]
fn supported_features_are_declared() {
    with_session(|client| {
        let response = client.exchange("qSupported:multiprocess+;swbreak+");
        assert_eq!(response, "vContSupported+;qXfer:features:read+");
        let response = client.exchange("vCont?");
        assert_eq!(response, "vCont;c;C;s;S");
    });
}

#[test]
fn stop_reply_halts_target_and_reads_registers() {
    let target = with_session(|client| {
        assert_eq!(client.exchange("?"), "T05thread:0;");
        // 17 registers, 4 bytes each, two hex digits per byte.
        let registers = client.exchange("g");
        assert_eq!(registers.len(), 17 * 4 * 2);
        // r1 = 0x10, little-endian.
        assert_eq!(&registers[8..16], "10000000");
    });
    assert!(!target.running);
}

#[test]
fn register_write_read_round_trip() {
    with_session(|client| {
        assert_eq!(client.exchange("?"), "T05thread:0;");
        assert_eq!(client.exchange("P0=deadbeef"), "OK");
        assert_eq!(client.exchange("p0"), "deadbeef");
    });
}

#[test]
fn memory_write_read_round_trip() {
    with_session(|client| {
        assert_eq!(client.exchange("?"), "T05thread:0;");
        assert_eq!(client.exchange("M20,4:01020304"), "OK");
        assert_eq!(client.exchange("m20,4"), "01020304");
        assert_eq!(client.exchange("m22,2"), "0304");
    });
}

#[test]
fn continue_and_step_report_sigtrap() {
    with_session(|client| {
        assert_eq!(client.exchange("?"), "T05thread:0;");
        assert_eq!(client.exchange("c"), "T05thread:0;");
        assert_eq!(client.exchange("vCont;c"), "T05thread:0;");
        assert_eq!(client.exchange("s"), "T05thread:0;");
        // Declared but rejected resume actions.
        assert!(client.exchange("vCont;C05").starts_with("E61"));
    });
}

#[test]
fn unsupported_breakpoints_get_empty_response() {
    let target = with_session(|client| {
        assert_eq!(client.exchange("?"), "T05thread:0;");
        // The stub rejects software breakpoints: empty response tells the
        // debugger to try something else.
        assert_eq!(client.exchange("Z0,1000,4"), "");
        // Hardware breakpoints are accepted.
        assert_eq!(client.exchange("Z1,1000,4"), "OK");
        assert_eq!(client.exchange("z1,1000,4"), "OK");
    });
    assert!(target.hardware_breakpoints.is_empty());
}

#[test]
fn target_description_is_served_in_chunks() {
    with_session(|client| {
        let response = client.exchange("qXfer:features:read:target.xml:0,1000");
        assert!(response.starts_with('l'));
        assert!(response.contains("armv4t"));

        let first = client.exchange("qXfer:features:read:target.xml:0,10");
        assert!(first.starts_with('m'));
        assert_eq!(first.len(), 1 + 0x10);
    });
}

#[test]
fn lldb_host_info_and_error_strings() {
    with_session(|client| {
        assert_eq!(client.exchange("QEnableErrorStrings"), "OK");
        let info = client.exchange("qHostInfo");
        assert!(info.contains("ptrsize:4;"));
        assert!(info.contains("endian:little;"));
        // Errors now carry the LLDB message suffix.
        assert_eq!(client.exchange("?"), "T05thread:0;");
        let response = client.exchange("p7f");
        assert!(response.starts_with("E62;"), "{response}");
    });
}

#[test]
fn detach_resumes_target() {
    let target = with_session(|client| {
        assert_eq!(client.exchange("?"), "T05thread:0;");
        assert_eq!(client.exchange("D"), "OK");
    });
    assert!(target.running);
}
