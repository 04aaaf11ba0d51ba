pub mod config;

use anyhow::{bail, Context, Result};
use pnet::datalink::{self, Channel, DataLinkSender, MacAddr};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use unilease_core::Config;
use unilease_net::arp::{ArpProbe, ConflictProbe};
use unilease_net::dhcp::{
    DhcpAction, DhcpPacket, LeaseManager, DHCP_CLIENT_PORT, DHCP_SERVER_PORT,
};

/// Peels Ethernet/IPv4/UDP off an inbound frame and, if it carries a DHCP
/// message for us, runs it through the lease manager and injects whatever
/// reply comes back. Non-DHCP traffic and malformed frames fall through
/// silently; only capture and injection failures surface as errors.
pub fn process_ethernet_frame(
    tx: &mut Box<dyn DataLinkSender>,
    our_mac: MacAddr,
    frame: &[u8],
    manager: &mut LeaseManager,
    probe: &dyn ConflictProbe,
    config: &Config,
) -> Result<()> {
    let Some(ethernet_packet) = EthernetPacket::new(frame) else {
        return Ok(());
    };
    if ethernet_packet.get_ethertype() != EtherTypes::Ipv4 {
        return Ok(());
    }
    let Some(ip_packet) = Ipv4Packet::new(ethernet_packet.payload()) else {
        return Ok(());
    };
    if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return Ok(());
    }
    let Some(udp_packet) = UdpPacket::new(ip_packet.payload()) else {
        return Ok(());
    };
    let src_port = udp_packet.get_source();
    let dst_port = udp_packet.get_destination();
    let dhcp_ports = [DHCP_SERVER_PORT, DHCP_CLIENT_PORT];
    if !dhcp_ports.contains(&src_port) && !dhcp_ports.contains(&dst_port) {
        return Ok(());
    }
    let Some(dhcp_packet) = DhcpPacket::from_bytes(udp_packet.payload()) else {
        debug!("Dropping malformed DHCP payload");
        return Ok(());
    };

    // Replies are addressed to the MAC the frame actually came from,
    // which can differ from chaddr for relayed or spoofed requests.
    let requester_mac = ethernet_packet.get_source();

    match manager.handle_packet(&dhcp_packet, probe)? {
        DhcpAction::Offer { response, .. } => {
            let reply = build_reply_frame(&response, our_mac, requester_mac, config.dhcplisten);
            inject(tx, &reply)?;
            info!("OFFER sent for {}", config.offeredip);
        }
        DhcpAction::Ack { response, .. } => {
            let reply = build_reply_frame(&response, our_mac, requester_mac, config.dhcplisten);
            inject(tx, &reply)?;
            info!("ACK sent for {}", config.offeredip);
        }
        DhcpAction::NoResponse => {}
    }
    Ok(())
}

/// Wraps a BOOTP/DHCP payload in UDP/IPv4/Ethernet headers. The IP
/// destination is always the limited broadcast address; the Ethernet
/// destination is the requester's source MAC so the offer reaches a host
/// that does not yet have an address.
pub fn build_reply_frame(
    dhcp_payload: &[u8],
    our_mac: MacAddr,
    client_mac: MacAddr,
    server_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut udp_buf = vec![0u8; 8 + dhcp_payload.len()];
    let mut udp_packet = MutableUdpPacket::new(&mut udp_buf).unwrap();
    udp_packet.set_source(67);
    udp_packet.set_destination(68);
    udp_packet.set_length((8 + dhcp_payload.len()) as u16);
    udp_packet.set_payload(dhcp_payload);

    let mut ip_buf = vec![0u8; 20 + udp_packet.packet().len()];
    let mut ip_packet = MutableIpv4Packet::new(&mut ip_buf).unwrap();
    ip_packet.set_version(4);
    ip_packet.set_header_length(5);
    ip_packet.set_total_length((20 + udp_packet.packet().len()) as u16);
    ip_packet.set_ttl(64);
    ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip_packet.set_source(server_ip);
    ip_packet.set_destination(Ipv4Addr::BROADCAST);

    ip_packet.set_payload(udp_packet.packet());
    let checksum = pnet::packet::ipv4::checksum(&ip_packet.to_immutable());
    ip_packet.set_checksum(checksum);
    let udp_checksum = pnet::packet::udp::ipv4_checksum(
        &udp_packet.to_immutable(),
        &ip_packet.get_source(),
        &ip_packet.get_destination(),
    );
    udp_packet.set_checksum(udp_checksum);
    // The UDP checksum was written after the payload was copied into the
    // IP buffer, so copy the finished UDP header back in.
    ip_packet.set_payload(udp_packet.packet());

    let mut eth_buf = vec![0u8; 14 + ip_packet.packet().len()];
    let mut eth_packet = MutableEthernetPacket::new(&mut eth_buf).unwrap();
    eth_packet.set_destination(client_mac);
    eth_packet.set_source(our_mac);
    eth_packet.set_ethertype(EtherTypes::Ipv4);
    eth_packet.set_payload(ip_packet.packet());

    eth_packet.packet().to_vec()
}

fn inject(tx: &mut Box<dyn DataLinkSender>, frame: &[u8]) -> Result<()> {
    match tx.send_to(frame, None) {
        Some(res) => res.context("Failed to send DHCP reply"),
        None => bail!("Failed to send DHCP reply"),
    }
}

/// Runs the capture loop until asked to stop. One invocation owns the
/// lease manager for its whole lifetime.
fn capture_loop(config: &Arc<Config>, running: &AtomicBool) -> Result<()> {
    let interfaces = datalink::interfaces();
    let interface = interfaces
        .into_iter()
        .find(|iface| iface.name == config.dhcpif)
        .with_context(|| format!("Interface {} not found", config.dhcpif))?;
    let our_mac = interface
        .mac
        .with_context(|| format!("No MAC address on interface {}", config.dhcpif))?;

    let mut channel_config = datalink::Config::default();
    // Bounded reads so a stop request is observed within ~100ms
    channel_config.read_timeout = Some(Duration::from_millis(100));
    let (mut tx, mut rx) = match datalink::channel(&interface, channel_config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => bail!("Unknown channel type for {}", config.dhcpif),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open channel on {}", config.dhcpif))
        }
    };

    let mut manager = LeaseManager::new(config.clone());
    let probe = ArpProbe::new(config.dhcpif.clone());

    info!(
        "DHCP server started on {}, serving {} from {}",
        config.dhcpif, config.offeredip, config.dhcplisten
    );

    while running.load(Ordering::SeqCst) {
        match rx.next() {
            Ok(frame) => {
                process_ethernet_frame(&mut tx, our_mac, frame, &mut manager, &probe, config)?
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e).context("Failed to read from capture channel"),
        }
    }

    info!("DHCP server stopped.");
    Ok(())
}

/// Lifecycle wrapper around the capture loop: start spawns it on a
/// blocking task, stop signals it and waits for it to wind down.
pub struct DhcpService {
    config: Arc<Config>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl DhcpService {
    pub fn new(config: Arc<Config>) -> Self {
        DhcpService {
            config,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Starts the capture task. A second call while running is a no-op.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = self.config.clone();
        let running = self.running.clone();
        self.task = Some(tokio::task::spawn_blocking(move || {
            let result = capture_loop(&config, &running);
            running.store(false, Ordering::SeqCst);
            result
        }));
    }

    /// Signals the capture task to stop and waits for it. Surfaces any
    /// error the loop exited with. Safe to call when already stopped.
    pub async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.await.context("Capture task panicked")??;
        }
        Ok(())
    }

    /// Whether the capture task is live. Goes false on its own if the
    /// task exits with an error; `stop` then reports that error.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
