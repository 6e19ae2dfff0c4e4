//! `oasis-recv`: receives one or more files over a serial line using the
//! stop-and-wait transfer protocol and writes them under a host directory.

use anyhow::{Context, Result};
use chrono::TimeZone;
use clap::Parser;
use log::{info, LevelFilter};
use oasis_tools::config::SerialConfig;
use oasis_tools::deb::Deb;
use oasis_tools::error::{OasisError, Result as OasisResult};
use oasis_tools::link::pcap::PcapWriter;
use oasis_tools::link::receiver::{OutputSink, Receiver, ReceiverConfig};
use oasis_tools::link::serial_port::{CapturingPort, SerialPort, UnixSerialPort};
use oasis_tools::timestamp::OasisTimestamp;
use std::io::Write;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Parser)]
#[command(name = "oasis-recv", about = "Receive OASIS files over a serial line")]
struct Cli {
    /// Directory to write received files into.
    #[arg(default_value = ".")]
    out_dir: PathBuf,

    /// Strip the trailing SUB (0x1A) padding byte from each received file.
    #[arg(long)]
    ascii: bool,

    /// Optional TOML configuration file (built-in defaults apply otherwise).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial device override.
    #[arg(long)]
    device: Option<String>,

    /// Optional PCAP capture path.
    #[arg(long)]
    pcap: Option<String>,

    #[arg(long)]
    verbose: bool,
}

/// Writes received files under a host directory, applying the DEB
/// timestamp to each file's mtime and optionally stripping the trailing
/// SUB padding byte on close.
struct HostFileSink {
    out_dir: PathBuf,
    ascii: bool,
    current: Option<(PathBuf, std::fs::File)>,
}

impl HostFileSink {
    fn new(out_dir: PathBuf, ascii: bool) -> Self {
        HostFileSink {
            out_dir,
            ascii,
            current: None,
        }
    }
}

impl OutputSink for HostFileSink {
    fn open(&mut self, _deb: &Deb, host_name: &str) -> OasisResult<()> {
        let path = self.out_dir.join(host_name);
        let file = std::fs::File::create(&path)?;
        self.current = Some((path, file));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> OasisResult<()> {
        let (_, file) = self
            .current
            .as_mut()
            .ok_or_else(|| OasisError::protocol("write with no file open"))?;
        file.write_all(data)?;
        Ok(())
    }

    fn close(&mut self, deb: &Deb) -> OasisResult<()> {
        let (path, file) = self
            .current
            .take()
            .ok_or_else(|| OasisError::protocol("close with no file open"))?;
        drop(file);

        if self.ascii {
            let mut data = std::fs::read(&path)?;
            if data.last() == Some(&0x1A) {
                data.pop();
            }
            std::fs::write(&path, &data)?;
        }

        if let Some(mtime) = system_time_from_oasis(&deb.timestamp) {
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            let _ = file.set_modified(mtime);
        }
        Ok(())
    }
}

/// Converts a packed OASIS timestamp to a host `SystemTime`. Returns
/// `None` for a field combination chrono can't represent (the format
/// already clamps on encode, so this should only fail on exotic unpacked
/// values arriving over the wire).
fn system_time_from_oasis(ts: &OasisTimestamp) -> Option<SystemTime> {
    let naive = chrono::NaiveDate::from_ymd_opt(ts.year as i32, ts.month as u32, ts.day as u32)?
        .and_hms_opt(ts.hour as u32, ts.minute as u32, 0)?;
    let utc = chrono::Utc.from_utc_datetime(&naive);
    let secs = utc.timestamp();
    if secs < 0 {
        return None;
    }
    Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs as u64))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );

    let mut config = match &cli.config {
        Some(path) => SerialConfig::load(path)?,
        None => SerialConfig::default(),
    };
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(pcap) = &cli.pcap {
        config.pcap_path = Some(pcap.clone());
    }

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("creating {}", cli.out_dir.display()))?;

    let mut raw_port = UnixSerialPort::open(&config.device, config.baud, config.enq_timeout())
        .with_context(|| format!("opening serial device {}", config.device))?;

    let mut captured_port;
    let port: &mut dyn SerialPort = match config.pcap_path.as_ref() {
        Some(p) => {
            captured_port = CapturingPort::new(&mut raw_port, PcapWriter::create(p)?);
            &mut captured_port
        }
        None => &mut raw_port,
    };

    let receiver_config = ReceiverConfig {
        ack_timeout: config.ack_timeout(),
        enq_timeout: config.enq_timeout(),
    };
    let mut sink = HostFileSink::new(cli.out_dir.clone(), cli.ascii);
    let mut receiver = Receiver::new(port, &mut sink, receiver_config);
    receiver.run_session().context("transfer session failed")?;

    info!("transfer complete, files written under {}", cli.out_dir.display());
    Ok(())
}
