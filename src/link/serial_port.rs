//! Blocking serial port abstraction: a narrow read/write/timeout interface
//! that keeps platform-specific serial drivers out of the transfer state
//! machines. A termios-backed Unix implementation covers real hardware;
//! a loopback implementation backs the sender/receiver tests.

use crate::error::{OasisError, Result};
use crate::link::pcap::{Event, PcapWriter};
use std::io::{Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait SerialPort {
    /// Reads up to `buf.len()` bytes, blocking up to the configured
    /// timeout. Returns 0 on timeout, never on a genuine I/O error (which
    /// is surfaced as `Err`).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
}

#[cfg(unix)]
pub struct UnixSerialPort {
    file: std::fs::File,
}

#[cfg(unix)]
impl UnixSerialPort {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        let mut tio = termios::Termios::from_fd(fd)
            .map_err(|e| OasisError::invalid_argument(format!("termios::from_fd failed: {e}")))?;

        termios::cfmakeraw(&mut tio);
        let speed = baud_to_termios(baud)?;
        termios::cfsetspeed(&mut tio, speed)
            .map_err(|e| OasisError::invalid_argument(format!("cfsetspeed failed: {e}")))?;
        tio.c_cflag |= termios::CREAD | termios::CLOCAL;
        tio.c_cc[termios::VMIN] = 0;
        tio.c_cc[termios::VTIME] = (timeout.as_millis() / 100).min(255) as u8;
        termios::tcsetattr(fd, termios::TCSANOW, &tio)
            .map_err(|e| OasisError::invalid_argument(format!("tcsetattr failed: {e}")))?;

        Ok(UnixSerialPort { file })
    }
}

#[cfg(unix)]
fn baud_to_termios(baud: u32) -> Result<termios::speed_t> {
    match baud {
        1200 => Ok(termios::B1200),
        2400 => Ok(termios::B2400),
        4800 => Ok(termios::B4800),
        9600 => Ok(termios::B9600),
        19200 => Ok(termios::B19200),
        38400 => Ok(termios::B38400),
        57600 => Ok(termios::B57600),
        115200 => Ok(termios::B115200),
        other => Err(OasisError::invalid_argument(format!("unsupported baud rate {other}"))),
    }
}

#[cfg(unix)]
impl SerialPort for UnixSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file.write(buf)?)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.file.as_raw_fd();
        let mut tio = termios::Termios::from_fd(fd)
            .map_err(|e| OasisError::invalid_argument(format!("termios::from_fd failed: {e}")))?;
        tio.c_cc[termios::VTIME] = (timeout.as_millis() / 100).min(255) as u8;
        termios::tcsetattr(fd, termios::TCSANOW, &tio)
            .map_err(|e| OasisError::invalid_argument(format!("tcsetattr failed: {e}")))?;
        Ok(())
    }
}

/// In-memory loopback port for tests: bytes written to one end appear for
/// reading at the paired end.
pub struct LoopbackPort {
    pub inbound: std::collections::VecDeque<u8>,
    pub outbound: Vec<u8>,
}

impl LoopbackPort {
    pub fn new() -> Self {
        LoopbackPort {
            inbound: std::collections::VecDeque::new(),
            outbound: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }
}

impl Default for LoopbackPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Wraps a [`SerialPort`] and mirrors every read/write into a [`PcapWriter`]
/// as an RX/TX record, so a capture reflects exactly what the
/// sender/receiver state machines saw on the wire.
pub struct CapturingPort<'a> {
    inner: &'a mut dyn SerialPort,
    writer: PcapWriter,
}

impl<'a> CapturingPort<'a> {
    pub fn new(inner: &'a mut dyn SerialPort, writer: PcapWriter) -> Self {
        CapturingPort { inner, writer }
    }
}

fn now_parts() -> (u32, u32) {
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (dur.as_secs() as u32, dur.subsec_micros())
}

impl<'a> SerialPort for CapturingPort<'a> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let (secs, micros) = now_parts();
            let _ = self.writer.write_record(secs, micros, Event::Rx, 0, &buf[..n]);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf)?;
        let (secs, micros) = now_parts();
        let _ = self.writer.write_record(secs, micros, Event::Tx, 0, &buf[..n]);
        Ok(n)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.inner.set_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_read_returns_zero_when_empty() {
        let mut port = LoopbackPort::new();
        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn loopback_feed_then_read() {
        let mut port = LoopbackPort::new();
        port.feed(&[1, 2, 3]);
        let mut buf = [0u8; 2];
        assert_eq!(port.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn capturing_port_records_both_directions() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        {
            let mut port = LoopbackPort::new();
            port.feed(&[0xAA]);
            let writer = PcapWriter::create(&path).unwrap();
            let mut capture = CapturingPort::new(&mut port, writer);
            let mut buf = [0u8; 1];
            assert_eq!(capture.read(&mut buf).unwrap(), 1);
            assert_eq!(capture.write(&[0xBB]).unwrap(), 1);
        }
        let bytes = std::fs::read(&path).unwrap();
        // Global header + two records, each 16-byte pcap header + 12-byte
        // pseudo-header + 1 payload byte.
        assert_eq!(bytes.len(), 24 + 2 * (16 + 12 + 1));
        std::fs::remove_file(&path).ok();
    }
}
