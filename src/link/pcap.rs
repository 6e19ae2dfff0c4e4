//! Optional PCAP capture of serial traffic.
//!
//! No pcap crate is available in this workspace's dependency stack, so the
//! classic global-header/record-header layout is hand-rolled here.

use crate::error::Result;
use std::fs::File;
use std::io::Write;

/// RTAC Serial link type.
const LINKTYPE_RTAC_SERIAL: u32 = 250;
const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Tx = 0x01,
    Rx = 0x02,
}

pub struct PcapWriter {
    file: File,
}

impl PcapWriter {
    pub fn create(path: &str) -> Result<Self> {
        let mut file = File::create(path)?;
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        header.extend_from_slice(&LINKTYPE_RTAC_SERIAL.to_le_bytes());
        file.write_all(&header)?;
        Ok(PcapWriter { file })
    }

    /// Appends one record: a 12-byte RTAC Serial pseudo-header (seconds,
    /// microseconds, event type, control-line state, 4 reserved bytes, all
    /// big-endian except the two single-byte fields) followed by `data`
    /// masked to 7 bits.
    pub fn write_record(
        &mut self,
        seconds: u32,
        microseconds: u32,
        event: Event,
        control_lines: u8,
        data: &[u8],
    ) -> Result<()> {
        let mut pseudo = Vec::with_capacity(12 + data.len());
        pseudo.extend_from_slice(&seconds.to_be_bytes());
        pseudo.extend_from_slice(&microseconds.to_be_bytes());
        pseudo.push(event as u8);
        pseudo.push(control_lines);
        pseudo.extend_from_slice(&[0u8; 4]);
        pseudo.extend(data.iter().map(|&b| b & 0x7F));

        let incl_len = pseudo.len() as u32;
        let mut record_header = Vec::with_capacity(16);
        record_header.extend_from_slice(&seconds.to_le_bytes());
        record_header.extend_from_slice(&microseconds.to_le_bytes());
        record_header.extend_from_slice(&incl_len.to_le_bytes());
        record_header.extend_from_slice(&incl_len.to_le_bytes());

        self.file.write_all(&record_header)?;
        self.file.write_all(&pseudo)?;
        Ok(())
    }
}
