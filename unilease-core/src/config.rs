use serde::Deserialize;
use std::net::Ipv4Addr;

// Helper functions for default values
fn default_dhcpif() -> String { "eth0".to_string() }
fn default_dhcplisten() -> Ipv4Addr { "192.168.32.100".parse().unwrap() }
fn default_offeredip() -> Ipv4Addr { "192.168.32.102".parse().unwrap() }
fn default_lease() -> u32 { 3600 }

/// Fixed per-run configuration. The address pool is exactly one entry:
/// `offeredip` is the only address the server will ever hand out.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Interface the server captures and injects on.
    #[serde(default = "default_dhcpif")]
    pub dhcpif: String,
    /// Our own address, used as IP source and DHCP server identifier.
    #[serde(default = "default_dhcplisten")]
    pub dhcplisten: Ipv4Addr,
    /// The single address offered to clients.
    #[serde(default = "default_offeredip")]
    pub offeredip: Ipv4Addr,
    /// Lease duration in seconds.
    #[serde(default = "default_lease")]
    pub lease: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dhcpif: default_dhcpif(),
            dhcplisten: default_dhcplisten(),
            offeredip: default_offeredip(),
            lease: default_lease(),
        }
    }
}
