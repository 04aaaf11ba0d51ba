use std::net::Ipv4Addr;
use unilease_core::Config;

fn load_test_config() -> Config {
    let config_contents =
        std::fs::read_to_string("tests/unilease.toml").expect("Failed to read config file");
    toml::from_str(&config_contents).expect("Failed to parse config file")
}

#[test]
fn test_load_full_config() {
    let config = load_test_config();
    assert_eq!(config.dhcpif, "eth1");
    assert_eq!(config.dhcplisten, Ipv4Addr::new(192, 168, 32, 100));
    assert_eq!(config.offeredip, Ipv4Addr::new(192, 168, 32, 102));
    assert_eq!(config.lease, 7200);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config: Config = toml::from_str("").expect("Failed to parse empty config");
    assert_eq!(config, Config::default());
    assert_eq!(config.dhcpif, "eth0");
    assert_eq!(config.lease, 3600);
}

#[test]
fn test_partial_config_fills_remaining_defaults() {
    let config: Config =
        toml::from_str("dhcpif = \"wlan0\"\nlease = 60\n").expect("Failed to parse config");
    assert_eq!(config.dhcpif, "wlan0");
    assert_eq!(config.lease, 60);
    assert_eq!(config.dhcplisten, Ipv4Addr::new(192, 168, 32, 100));
    assert_eq!(config.offeredip, Ipv4Addr::new(192, 168, 32, 102));
}
