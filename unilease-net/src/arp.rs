use anyhow::{bail, Context, Result};
use pnet::datalink::{self, Channel, MacAddr};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Answers whether an IPv4 address is already in use on the link.
pub trait ConflictProbe {
    fn in_use(&self, target: Ipv4Addr) -> Result<bool>;
}

/// Probes for address conflicts by broadcasting a single ARP request and
/// listening for a reply. Any host answering for the address within the
/// window counts as a conflict; silence counts as free.
///
/// The call blocks for up to [`PROBE_TIMEOUT`] and is meant to run on the
/// capture task, which is already a blocking task.
pub struct ArpProbe {
    interface: String,
}

/// How long to wait for a claimant before declaring the address free.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

impl ArpProbe {
    pub fn new(interface: impl Into<String>) -> Self {
        ArpProbe {
            interface: interface.into(),
        }
    }
}

impl ConflictProbe for ArpProbe {
    fn in_use(&self, target: Ipv4Addr) -> Result<bool> {
        let interfaces = datalink::interfaces();
        let interface = interfaces
            .into_iter()
            .find(|iface| iface.name == self.interface)
            .with_context(|| format!("Interface {} not found", self.interface))?;

        let our_ip = interface
            .ips
            .iter()
            .find(|ip| ip.is_ipv4())
            .map(|ip| match ip.ip() {
                std::net::IpAddr::V4(ip) => ip,
                _ => unreachable!(),
            })
            .with_context(|| format!("No IPv4 address on interface {}", self.interface))?;

        let our_mac = interface
            .mac
            .with_context(|| format!("No MAC address on interface {}", self.interface))?;

        let mut config = datalink::Config::default();
        config.read_timeout = Some(Duration::from_millis(100));
        let (mut tx, mut rx) = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => bail!("Unknown channel type for {}", self.interface),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open channel on {}", self.interface))
            }
        };

        let request = build_arp_request(our_mac, our_ip, target);
        match tx.send_to(&request, None) {
            Some(res) => res.context("Failed to send ARP probe")?,
            None => bail!("Failed to send ARP probe"),
        }

        debug!("Probing {} for a claimant", target);
        let start_time = Instant::now();
        while start_time.elapsed() < PROBE_TIMEOUT {
            match rx.next() {
                Ok(frame) => {
                    if reply_claims(frame, target) {
                        return Ok(true);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e).context("Failed to read from ARP probe channel"),
            }
        }
        Ok(false)
    }
}

/// Builds a broadcast ARP who-has frame for `target`.
fn build_arp_request(our_mac: MacAddr, our_ip: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
    let mut ethernet_buffer = [0u8; 42];
    let mut request_packet = MutableEthernetPacket::new(&mut ethernet_buffer).unwrap();

    request_packet.set_destination(MacAddr::broadcast());
    request_packet.set_source(our_mac);
    request_packet.set_ethertype(EtherTypes::Arp);

    let mut arp_buffer = [0u8; 28];
    let mut arp_packet = MutableArpPacket::new(&mut arp_buffer).unwrap();

    arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp_packet.set_protocol_type(EtherTypes::Ipv4);
    arp_packet.set_hw_addr_len(6);
    arp_packet.set_proto_addr_len(4);
    arp_packet.set_operation(ArpOperations::Request);
    arp_packet.set_sender_hw_addr(our_mac);
    arp_packet.set_sender_proto_addr(our_ip);
    arp_packet.set_target_hw_addr(MacAddr::zero());
    arp_packet.set_target_proto_addr(target);

    request_packet.set_payload(arp_packet.packet());
    request_packet.packet().to_vec()
}

/// Whether `frame` is an ARP reply in which the sender claims `target`.
fn reply_claims(frame: &[u8], target: Ipv4Addr) -> bool {
    let Some(ethernet_frame) = EthernetPacket::new(frame) else {
        return false;
    };
    if ethernet_frame.get_ethertype() != EtherTypes::Arp {
        return false;
    }
    let Some(arp_reply) = ArpPacket::new(ethernet_frame.payload()) else {
        return false;
    };
    arp_reply.get_operation() == ArpOperations::Reply
        && arp_reply.get_sender_proto_addr() == target
}
