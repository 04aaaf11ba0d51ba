pub mod arp;
pub mod dhcp;

pub use arp::{ArpProbe, ConflictProbe};
pub use dhcp::{DhcpAction, DhcpPacket, LeaseManager};
