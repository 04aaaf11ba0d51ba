use crate::arp::ConflictProbe;
use anyhow::Result;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use unilease_core::Config;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Actions for the caller to take after a message has been evaluated.
/// Refusals carry no payload at all: the server never answers with a NAK,
/// it simply stays silent and leaves retries to the client.
pub enum DhcpAction {
    Offer { response: Vec<u8>, client_mac: [u8; 6] },
    Ack { response: Vec<u8>, client_mac: [u8; 6] },
    NoResponse,
}

/// DHCP Message Types (RFC 2132)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

/// BOOTP Message Types
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum BootpMessageType {
    BootRequest = 1,
    BootReply = 2,
}

// DHCP Options
pub const DHCP_OPTION_PAD: u8 = 0;
pub const DHCP_OPTION_REQUESTED_IP: u8 = 50;
pub const DHCP_OPTION_LEASE_TIME: u8 = 51;
pub const DHCP_OPTION_MESSAGE_TYPE: u8 = 53;
pub const DHCP_OPTION_SERVER_ID: u8 = 54;
pub const DHCP_OPTION_END: u8 = 255;

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Represents a BOOTP/DHCP packet.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: u32,
    pub yiaddr: u32,
    pub siaddr: u32,
    pub giaddr: u32,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: [u8; 312],
}

impl DhcpPacket {
    pub fn from_bytes(data: &[u8]) -> Option<DhcpPacket> {
        if data.len() < 240 {
            // Minimum DHCP packet size
            return None;
        }
        // Payloads are usually shorter than the full 548-byte layout, so
        // copy into a zeroed full-size buffer first. The option walk then
        // sees PAD bytes where the payload ended instead of reading past
        // the caller's slice.
        let mut buf = [0u8; std::mem::size_of::<DhcpPacket>()];
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        let packet = unsafe { std::ptr::read(buf.as_ptr() as *const DhcpPacket) };
        if packet.options[0..4] != DHCP_MAGIC_COOKIE {
            return None;
        }
        Some(packet)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Option<&mut DhcpPacket> {
        if data.len() < 240 {
            return None;
        }
        // The cookie is not checked here: the caller may be about to write it.
        let packet = unsafe { &mut *(data.as_mut_ptr() as *mut DhcpPacket) };
        Some(packet)
    }

    pub fn get_option(&self, code: u8) -> Option<&[u8]> {
        let mut options = &self.options[4..];
        while !options.is_empty() {
            let option_code = options[0];
            if option_code == DHCP_OPTION_PAD {
                options = &options[1..];
                continue;
            }
            if option_code == DHCP_OPTION_END {
                break;
            }
            if options.len() < 2 {
                break;
            }
            let len = options[1] as usize;
            if options.len() < 2 + len {
                break;
            }
            if option_code == code {
                return Some(&options[2..2 + len]);
            }
            options = &options[2 + len..];
        }
        None
    }

    pub fn get_message_type(&self) -> Option<DhcpMessageType> {
        self.get_option(DHCP_OPTION_MESSAGE_TYPE)
            .and_then(|data| data.first())
            .and_then(|&byte| match byte {
                1 => Some(DhcpMessageType::Discover),
                2 => Some(DhcpMessageType::Offer),
                3 => Some(DhcpMessageType::Request),
                4 => Some(DhcpMessageType::Decline),
                5 => Some(DhcpMessageType::Ack),
                6 => Some(DhcpMessageType::Nak),
                7 => Some(DhcpMessageType::Release),
                8 => Some(DhcpMessageType::Inform),
                _ => None,
            })
    }

    pub fn get_mac(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        mac
    }

    /// The requested IP address (option 50), if the client sent one.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(DHCP_OPTION_REQUESTED_IP)
            .and_then(|d| TryInto::<[u8; 4]>::try_into(d).ok())
            .map(Ipv4Addr::from)
    }
}

/// A time-bounded binding of the single pool address to one client MAC.
#[derive(Debug, Clone)]
pub struct Lease {
    pub mac: [u8; 6],
    pub expires: SystemTime,
}

/// The protocol state machine. Owns the single lease slot and decides,
/// per inbound message, whether to offer, acknowledge, or stay silent.
///
/// There is no lock around the slot: one capture task owns the manager
/// mutably and frames are handled strictly one at a time, so the
/// decide-then-reply window can never interleave within a process.
pub struct LeaseManager {
    config: Arc<Config>,
    slot: Option<Lease>,
}

impl LeaseManager {
    pub fn new(config: Arc<Config>) -> Self {
        LeaseManager { config, slot: None }
    }

    /// The current lease, if any. Expiry is applied lazily on the next
    /// inbound message, so a stale entry may still be visible here.
    pub fn current_lease(&self) -> Option<&Lease> {
        self.slot.as_ref()
    }

    pub fn handle_packet(
        &mut self,
        packet: &DhcpPacket,
        probe: &dyn ConflictProbe,
    ) -> Result<DhcpAction> {
        self.handle_at(packet, probe, SystemTime::now())
    }

    fn handle_at(
        &mut self,
        packet: &DhcpPacket,
        probe: &dyn ConflictProbe,
        now: SystemTime,
    ) -> Result<DhcpAction> {
        // Lazy expiry: an overdue lease is released before any evaluation.
        if let Some(lease) = &self.slot {
            if lease.expires <= now {
                info!("Lease for {} expired, releasing", hex::encode(lease.mac));
                self.slot = None;
            }
        }

        let msg_type = match packet.get_message_type() {
            Some(t) => t,
            None => {
                debug!("Dropping DHCP packet with no message type");
                return Ok(DhcpAction::NoResponse);
            }
        };

        let mac = packet.get_mac();

        match msg_type {
            DhcpMessageType::Discover => self.handle_discover(packet, mac, probe),
            DhcpMessageType::Request => self.handle_request(packet, mac, probe, now),
            other => {
                debug!("Ignoring DHCP {:?} from {}", other, hex::encode(mac));
                Ok(DhcpAction::NoResponse)
            }
        }
    }

    /// Whether the slot is free or already bound to this client.
    fn slot_allows(&self, mac: &[u8; 6]) -> bool {
        match &self.slot {
            None => true,
            Some(lease) => lease.mac == *mac,
        }
    }

    fn handle_discover(
        &self,
        packet: &DhcpPacket,
        mac: [u8; 6],
        probe: &dyn ConflictProbe,
    ) -> Result<DhcpAction> {
        info!("DISCOVER from {}", hex::encode(mac));

        if !self.slot_allows(&mac) {
            info!(
                "{} is leased to another client, staying silent",
                self.config.offeredip
            );
            return Ok(DhcpAction::NoResponse);
        }

        if probe.in_use(self.config.offeredip)? {
            warn!(
                "Conflict detected for {}, skipping offer",
                self.config.offeredip
            );
            return Ok(DhcpAction::NoResponse);
        }

        info!("Offering {} to {}", self.config.offeredip, hex::encode(mac));
        let response = self.build_reply(packet, DhcpMessageType::Offer);
        Ok(DhcpAction::Offer {
            response,
            client_mac: mac,
        })
    }

    fn handle_request(
        &mut self,
        packet: &DhcpPacket,
        mac: [u8; 6],
        probe: &dyn ConflictProbe,
        now: SystemTime,
    ) -> Result<DhcpAction> {
        let requested = packet.requested_ip();
        info!("REQUEST from {} for {:?}", hex::encode(mac), requested);

        // The pool has exactly one entry; anything else is refused by silence.
        if requested != Some(self.config.offeredip) {
            warn!(
                "Requested address {:?} does not match pool address {}, ignoring",
                requested, self.config.offeredip
            );
            return Ok(DhcpAction::NoResponse);
        }

        if !self.slot_allows(&mac) {
            info!(
                "{} is leased to another client, staying silent",
                self.config.offeredip
            );
            return Ok(DhcpAction::NoResponse);
        }

        if probe.in_use(self.config.offeredip)? {
            warn!(
                "Conflict detected for {}, cannot assign",
                self.config.offeredip
            );
            return Ok(DhcpAction::NoResponse);
        }

        // A repeated REQUEST from the leased client lands here too and
        // simply re-extends the expiry.
        self.slot = Some(Lease {
            mac,
            expires: now + Duration::from_secs(self.config.lease as u64),
        });

        info!(
            "Acknowledging {} for {}",
            self.config.offeredip,
            hex::encode(mac)
        );
        let response = self.build_reply(packet, DhcpMessageType::Ack);
        Ok(DhcpAction::Ack {
            response,
            client_mac: mac,
        })
    }

    /// Builds the BOOTP/DHCP payload for an OFFER or ACK. The transaction
    /// id and client hardware address are copied verbatim from the request
    /// so the client can correlate the reply.
    fn build_reply(&self, req_packet: &DhcpPacket, msg_type: DhcpMessageType) -> Vec<u8> {
        let mut response_buf = vec![0u8; 512];
        let packet = DhcpPacket::from_bytes_mut(&mut response_buf).unwrap();

        packet.op = BootpMessageType::BootReply as u8;
        packet.htype = req_packet.htype;
        packet.hlen = req_packet.hlen;
        packet.xid = req_packet.xid;
        packet.flags = req_packet.flags;
        packet.yiaddr = u32::from(self.config.offeredip).to_be();
        packet.siaddr = u32::from(self.config.dhcplisten).to_be();
        packet.chaddr = req_packet.chaddr;

        packet.options[0..4].copy_from_slice(&DHCP_MAGIC_COOKIE);
        let mut cursor = 4;

        // Message Type
        packet.options[cursor..cursor + 3]
            .copy_from_slice(&[DHCP_OPTION_MESSAGE_TYPE, 1, msg_type as u8]);
        cursor += 3;

        // Server ID
        packet.options[cursor..cursor + 2].copy_from_slice(&[DHCP_OPTION_SERVER_ID, 4]);
        packet.options[cursor + 2..cursor + 6]
            .copy_from_slice(&self.config.dhcplisten.octets());
        cursor += 6;

        // Lease Time
        packet.options[cursor..cursor + 2].copy_from_slice(&[DHCP_OPTION_LEASE_TIME, 4]);
        packet.options[cursor + 2..cursor + 6].copy_from_slice(&self.config.lease.to_be_bytes());
        cursor += 6;

        packet.options[cursor] = DHCP_OPTION_END;
        cursor += 1;

        // From the op code through DHCP_OPTION_END
        let final_len = 236 + cursor;
        response_buf.truncate(final_len);
        response_buf
    }
}
