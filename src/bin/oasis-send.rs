//! `oasis-send`: transmits a set of OASIS directory entries and their
//! content over a serial line using the stop-and-wait transfer protocol.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use oasis_tools::config::SerialConfig;
use oasis_tools::container;
use oasis_tools::filename::wildcard_match;
use oasis_tools::layout::DiskLayout;
use oasis_tools::link::pcap::PcapWriter;
use oasis_tools::link::sender::{HandshakeToggleStrictness, Sender, SenderConfig};
use oasis_tools::link::serial_port::{CapturingPort, SerialPort, UnixSerialPort};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "oasis-send", about = "Send OASIS files over a serial line")]
struct Cli {
    /// Disk image to read files from.
    image: PathBuf,

    /// Wildcard pattern of files to send.
    #[arg(default_value = "*.*")]
    pattern: String,

    /// Optional TOML configuration file (built-in defaults apply otherwise).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial device override.
    #[arg(long)]
    device: Option<String>,

    /// Optional PCAP capture path.
    #[arg(long)]
    pcap: Option<String>,

    /// Reject a wrong-toggle ACK during the ENQ handshake instead of
    /// accepting it and proceeding.
    #[arg(long)]
    strict_handshake: bool,

    #[arg(long)]
    verbose: bool,
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

    let mut container = container::open(&cli.image, false)
        .with_context(|| format!("opening {}", cli.image.display()))?;
    let layout = DiskLayout::load(container.as_mut())?;

    let mut raw_port = UnixSerialPort::open(&config.device, config.baud, config.ack_timeout())
        .with_context(|| format!("opening serial device {}", config.device))?;

    let mut captured_port;
    let port: &mut dyn SerialPort = match config.pcap_path.as_ref() {
        Some(p) => {
            captured_port = CapturingPort::new(&mut raw_port, PcapWriter::create(p)?);
            &mut captured_port
        }
        None => &mut raw_port,
    };

    let sender_config = SenderConfig {
        read_timeout: config.ack_timeout(),
        pacing_delay: config.pacing_delay(),
        handshake_strictness: if cli.strict_handshake {
            HandshakeToggleStrictness::Strict
        } else {
            HandshakeToggleStrictness::Tolerant
        },
    };
    let mut sender = Sender::new(port, sender_config);
    sender.handshake().context("ENQ handshake failed")?;
    info!("handshake complete");

    let mut sent = 0;
    for deb in &layout.debs {
        if !deb.file_format.is_valid_entry() {
            continue;
        }
        let host_name = deb.oasis_name.to_host_string();
        if !wildcard_match(&cli.pattern, &host_name) {
            continue;
        }
        info!("sending {host_name}");
        sender.send_open(deb).with_context(|| format!("SEND_OPEN for {host_name}"))?;
        let data = oasis_tools::reader::read_file(container.as_mut(), deb)?;
        if deb.file_format.organization() == Some(oasis_tools::deb::FileOrganization::Sequential) {
            sender.send_write_sequential(&data)?;
        } else {
            sender.send_write_contiguous(&data)?;
        }
        sender.send_close().with_context(|| format!("SEND_CLOSE for {host_name}"))?;
        sent += 1;
    }
    sender.finalize()?;
    info!("sent {sent} file(s)");
    Ok(())
}
