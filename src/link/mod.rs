//! Serial transfer protocol stack: link-layer codec and transfer state
//! machines.

pub mod codec;
pub mod pcap;
pub mod receiver;
pub mod sender;
pub mod serial_port;
