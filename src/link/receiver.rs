//! Transfer receiver state machine.
//!
//! `WAIT_ENQ -> ACK_AND_READ -> {HANDLE_OPEN, HANDLE_WRITE, HANDLE_CLOSE,
//! HANDLE_EOT}`. Built on [`codec`](super::codec) and
//! [`SerialPort`](super::serial_port::SerialPort); output files are written
//! through a caller-supplied [`OutputSink`].

use crate::deb::{Deb, DebWire, FileOrganization};
use crate::error::{OasisError, Result};
use crate::filename::OasisName;
use crate::link::codec::{decode_packet, DLE, ENQ, EOT};
use crate::link::serial_port::SerialPort;
use std::time::Duration;

pub const MAX_ACK_RETRIES: u32 = 5;
const SEQ_PAYLOAD_LEN: usize = 254;

/// Receives decoded file content. One call to [`open`](OutputSink::open)
/// per `O` packet, any number of [`write`](OutputSink::write) calls per
/// `W` packet, then one [`close`](OutputSink::close) per `C` packet.
pub trait OutputSink {
    fn open(&mut self, deb: &Deb, host_name: &str) -> Result<()>;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn close(&mut self, deb: &Deb) -> Result<()>;
}

struct CurrentFile {
    deb: Deb,
    bytes_written: usize,
    logical_len: usize,
}

pub struct ReceiverConfig {
    pub ack_timeout: Duration,
    pub enq_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            ack_timeout: Duration::from_millis(500),
            enq_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Receiver<'a> {
    port: &'a mut dyn SerialPort,
    sink: &'a mut dyn OutputSink,
    config: ReceiverConfig,
    toggle: u8,
    current: Option<CurrentFile>,
}

impl<'a> Receiver<'a> {
    pub fn new(port: &'a mut dyn SerialPort, sink: &'a mut dyn OutputSink, config: ReceiverConfig) -> Self {
        Receiver {
            port,
            sink,
            config,
            toggle: 0,
            current: None,
        }
    }

    /// WAIT_ENQ: discards bytes until ENQ arrives, then runs the session
    /// loop until `DLE EOT` or a fatal error.
    pub fn run_session(&mut self) -> Result<()> {
        self.wait_for_enq()?;
        self.toggle = 0;
        loop {
            match self.ack_and_read()? {
                SessionStep::Continue => {}
                SessionStep::Done => return Ok(()),
            }
        }
    }

    fn wait_for_enq(&mut self) -> Result<()> {
        self.port.set_timeout(self.config.enq_timeout)?;
        let mut byte = [0u8; 1];
        loop {
            let n = self.port.read(&mut byte)?;
            if n == 0 {
                return Err(OasisError::protocol("timed out waiting for ENQ"));
            }
            if byte[0] == ENQ {
                return Ok(());
            }
        }
    }

    /// One ACK_AND_READ cycle: sends the current-toggle ACK, reads the next
    /// frame, and dispatches it. A mid-transfer ENQ resets the toggle and
    /// restarts this cycle; a checksum failure resends the same ACK without
    /// flipping the toggle (a natural NAK).
    fn ack_and_read(&mut self) -> Result<SessionStep> {
        self.port.set_timeout(self.config.ack_timeout)?;
        for attempt in 0..=MAX_ACK_RETRIES {
            self.send_ack(self.toggle)?;

            let frame = match self.read_frame_or_control()? {
                InboundEvent::Frame(f) => f,
                InboundEvent::Eot => {
                    self.send_ack(self.toggle)?;
                    return Ok(SessionStep::Done);
                }
                InboundEvent::Enq => {
                    self.toggle = 0;
                    return Ok(SessionStep::Continue);
                }
                InboundEvent::Timeout => {
                    if attempt == MAX_ACK_RETRIES {
                        return Err(OasisError::protocol(
                            "no packet arrived after MAX_ACK_RETRIES",
                        ));
                    }
                    continue;
                }
            };

            let cmd = frame[2];
            match decode_packet(&frame) {
                Ok(decoded) => {
                    self.toggle ^= 1;
                    self.dispatch(cmd, &decoded.payload)?;
                    return Ok(SessionStep::Continue);
                }
                Err(_) => {
                    // Do not flip the toggle; looping resends the same ACK.
                    continue;
                }
            }
        }
        Err(OasisError::protocol("exhausted ACK retries without a valid packet"))
    }

    fn dispatch(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        match cmd {
            b'O' => self.handle_open(payload),
            b'W' => self.handle_write(payload),
            b'C' => self.handle_close(),
            other => Err(OasisError::protocol(format!("unknown command byte {other:#x}"))),
        }
    }

    fn handle_open(&mut self, payload: &[u8]) -> Result<()> {
        let deb = DebWire::from_bytes(payload)?;
        let host_name = deb.oasis_name.to_host_string();
        let logical_len = logical_length_hint(&deb);
        self.sink.open(&deb, &host_name)?;
        self.current = Some(CurrentFile {
            deb,
            bytes_written: 0,
            logical_len,
        });
        Ok(())
    }

    fn handle_write(&mut self, payload: &[u8]) -> Result<()> {
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| OasisError::protocol("W packet received with no file open"))?;

        let content: &[u8] = if current.deb.file_format.organization() == Some(FileOrganization::Sequential) {
            if payload.len() < 2 {
                return Err(OasisError::protocol("sequential W packet too short for sequence trailer"));
            }
            &payload[..payload.len() - 2]
        } else {
            payload
        };

        let remaining = current.logical_len.saturating_sub(current.bytes_written);
        let take = content.len().min(remaining);
        if take > 0 {
            self.sink.write(&content[..take])?;
            current.bytes_written += take;
        }
        Ok(())
    }

    fn handle_close(&mut self) -> Result<()> {
        let current = self
            .current
            .take()
            .ok_or_else(|| OasisError::protocol("C packet received with no file open"))?;
        self.sink.close(&current.deb)
    }

    fn send_ack(&mut self, toggle: u8) -> Result<()> {
        let digit = if toggle == 0 { b'0' } else { b'1' };
        self.port.write(&[DLE, digit])?;
        Ok(())
    }

    /// Reads a frame up to and including `DLE ETX LRC RUB`, or recognizes
    /// a bare `ENQ` / `DLE EOT` control sequence arriving instead.
    fn read_frame_or_control(&mut self) -> Result<InboundEvent> {
        let mut byte = [0u8; 1];
        let n = self.port.read(&mut byte)?;
        if n == 0 {
            return Ok(InboundEvent::Timeout);
        }
        if byte[0] & 0x7F == ENQ {
            return Ok(InboundEvent::Enq);
        }
        if byte[0] & 0x7F != DLE {
            return Err(OasisError::protocol("expected DLE at start of frame"));
        }

        let mut second = [0u8; 1];
        if self.port.read(&mut second)? == 0 {
            return Err(OasisError::protocol("truncated frame after leading DLE"));
        }
        if second[0] & 0x7F == EOT {
            return Ok(InboundEvent::Eot);
        }

        let mut frame = vec![byte[0], second[0]];
        let mut cmd = [0u8; 1];
        if self.port.read(&mut cmd)? == 0 {
            return Err(OasisError::protocol("truncated frame after STX"));
        }
        frame.push(cmd[0]);

        loop {
            let mut b = [0u8; 1];
            if self.port.read(&mut b)? == 0 {
                return Err(OasisError::protocol("frame truncated before trailer"));
            }
            frame.push(b[0]);
            if b[0] & 0x7F == DLE {
                let mut next = [0u8; 1];
                if self.port.read(&mut next)? == 0 {
                    return Err(OasisError::protocol("frame truncated after escape DLE"));
                }
                frame.push(next[0]);
                if next[0] & 0x7F == crate::link::codec::ETX {
                    let mut lrc = [0u8; 1];
                    if self.port.read(&mut lrc)? == 0 {
                        return Err(OasisError::protocol("frame truncated before LRC"));
                    }
                    frame.push(lrc[0]);
                    let mut rub = [0u8; 1];
                    if self.port.read(&mut rub)? == 0 {
                        return Err(OasisError::protocol("frame truncated before RUB"));
                    }
                    return Ok(InboundEvent::Frame(frame));
                }
            }
        }
    }
}

enum InboundEvent {
    Frame(Vec<u8>),
    Enq,
    Eot,
    Timeout,
}

enum SessionStep {
    Continue,
    Done,
}

/// Output-length clamp per organization, mirroring [`crate::reader`]'s
/// contiguous-read sizing so the receiver never writes past what the DEB
/// declares.
fn logical_length_hint(deb: &Deb) -> usize {
    match deb.file_format.organization() {
        Some(FileOrganization::Direct) => deb.record_count as usize * deb.ffd1 as usize,
        Some(FileOrganization::Indexed) | Some(FileOrganization::Keyed) => {
            deb.record_count as usize * (deb.ffd1 as usize & 0x1FF)
        }
        Some(FileOrganization::Relocatable) => deb.ffd2 as usize,
        _ => usize::MAX,
    }
}

/// In-memory [`OutputSink`] for tests.
pub struct MemSink {
    pub opened: Vec<(String, Deb)>,
    pub buffer: Vec<u8>,
    pub closed: Vec<Deb>,
}

impl MemSink {
    pub fn new() -> Self {
        MemSink {
            opened: Vec::new(),
            buffer: Vec::new(),
            closed: Vec::new(),
        }
    }
}

impl Default for MemSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for MemSink {
    fn open(&mut self, deb: &Deb, host_name: &str) -> Result<()> {
        self.opened.push((host_name.to_string(), *deb));
        self.buffer.clear();
        Ok(())
    }
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }
    fn close(&mut self, deb: &Deb) -> Result<()> {
        self.closed.push(*deb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deb::{FileFormat, FileOrganization};
    use crate::link::codec::encode_packet;
    use crate::link::serial_port::LoopbackPort;
    use crate::timestamp::OasisTimestamp;

    fn sample_deb(organization: FileOrganization) -> Deb {
        Deb {
            file_format: FileFormat::Regular {
                organization,
                attributes: 0,
            },
            oasis_name: OasisName::from_fields("FOO", "DAT").unwrap(),
            record_count: 1,
            block_count: 1,
            start_sector: 4,
            ffd1: 5,
            timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 0,
        }
    }

    #[test]
    fn full_session_open_write_close_eot() {
        let mut port = LoopbackPort::new();
        let deb = sample_deb(FileOrganization::Direct);
        let open_frame = encode_packet(b'O', &DebWire::to_bytes(&deb));
        let write_frame = encode_packet(b'W', b"hello");
        let close_frame = encode_packet(b'C', &[]);

        port.feed(&[ENQ]);
        port.feed(&open_frame);
        port.feed(&write_frame);
        port.feed(&close_frame);
        port.feed(&[DLE, EOT]);

        let mut sink = MemSink::new();
        let mut receiver = Receiver::new(&mut port, &mut sink, ReceiverConfig::default());
        receiver.run_session().unwrap();

        assert_eq!(sink.opened.len(), 1);
        assert_eq!(sink.opened[0].0, "FOO.DAT");
        assert_eq!(sink.buffer, b"hello");
        assert_eq!(sink.closed.len(), 1);
    }

    #[test]
    fn write_clamps_to_deb_logical_length() {
        let mut port = LoopbackPort::new();
        let mut deb = sample_deb(FileOrganization::Direct);
        deb.record_count = 1;
        deb.ffd1 = 3; // logical length 3 bytes
        let open_frame = encode_packet(b'O', &DebWire::to_bytes(&deb));
        let write_frame = encode_packet(b'W', b"abcdef");
        let close_frame = encode_packet(b'C', &[]);

        port.feed(&[ENQ]);
        port.feed(&open_frame);
        port.feed(&write_frame);
        port.feed(&close_frame);
        port.feed(&[DLE, EOT]);

        let mut sink = MemSink::new();
        let mut receiver = Receiver::new(&mut port, &mut sink, ReceiverConfig::default());
        receiver.run_session().unwrap();
        assert_eq!(sink.buffer, b"abc");
    }

    #[test]
    fn sequential_write_strips_trailing_sequence_number() {
        let mut port = LoopbackPort::new();
        let deb = sample_deb(FileOrganization::Sequential);
        let open_frame = encode_packet(b'O', &DebWire::to_bytes(&deb));
        let mut payload = b"hi".to_vec();
        payload.extend_from_slice(&1u16.to_le_bytes());
        let write_frame = encode_packet(b'W', &payload);
        let close_frame = encode_packet(b'C', &[]);

        port.feed(&[ENQ]);
        port.feed(&open_frame);
        port.feed(&write_frame);
        port.feed(&close_frame);
        port.feed(&[DLE, EOT]);

        let mut sink = MemSink::new();
        let mut receiver = Receiver::new(&mut port, &mut sink, ReceiverConfig::default());
        receiver.run_session().unwrap();
        assert_eq!(sink.buffer, b"hi");
    }

    #[test]
    fn corrupted_frame_does_not_flip_toggle_and_resends_ack() {
        let mut port = LoopbackPort::new();
        let deb = sample_deb(FileOrganization::Direct);
        let mut bad_open = encode_packet(b'O', &DebWire::to_bytes(&deb));
        let len = bad_open.len();
        bad_open[len - 2] ^= 0xFF; // tamper with the LRC byte
        let good_open = encode_packet(b'O', &DebWire::to_bytes(&deb));
        let close_frame = encode_packet(b'C', &[]);

        port.feed(&[ENQ]);
        port.feed(&bad_open);
        port.feed(&good_open);
        port.feed(&close_frame);
        port.feed(&[DLE, EOT]);

        let mut sink = MemSink::new();
        let mut receiver = Receiver::new(&mut port, &mut sink, ReceiverConfig::default());
        receiver.run_session().unwrap();
        assert_eq!(sink.opened.len(), 1);
    }

    #[test]
    fn mid_transfer_enq_resets_toggle() {
        let mut port = LoopbackPort::new();
        let deb = sample_deb(FileOrganization::Direct);
        let open_frame = encode_packet(b'O', &DebWire::to_bytes(&deb));
        let close_frame = encode_packet(b'C', &[]);

        port.feed(&[ENQ]);
        port.feed(&[ENQ]); // sender restart before any packet
        port.feed(&open_frame);
        port.feed(&close_frame);
        port.feed(&[DLE, EOT]);

        let mut sink = MemSink::new();
        let mut receiver = Receiver::new(&mut port, &mut sink, ReceiverConfig::default());
        receiver.run_session().unwrap();
        assert_eq!(sink.opened.len(), 1);
    }
}
