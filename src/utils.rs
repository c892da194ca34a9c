use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, Result};
use log::debug;
use pnet_datalink as datalink;
use rand::{thread_rng, Rng};

/// Find a local IPv4 address usable as the source of crafted packets.
///
/// Walks the network interfaces and picks the first non-loopback,
/// non-link-local IPv4 address. Raw probes stamped with a loopback source
/// would never see their answers, so there is no fallback: callers surface
/// the error and the affected case is reported as `error`.
pub fn find_local_ipv4() -> Result<Ipv4Addr> {
    let interfaces = datalink::interfaces();

    for interface in &interfaces {
        if interface.is_loopback() {
            continue;
        }

        for ip in &interface.ips {
            if let IpAddr::V4(ipv4) = ip.ip() {
                if !ipv4.is_loopback() && !ipv4.is_link_local() && !ipv4.is_multicast() {
                    debug!("Found IPv4 address: {} on interface {}", ipv4, interface.name);
                    return Ok(ipv4);
                }
            }
        }
    }

    Err(anyhow!("no usable non-loopback IPv4 interface found"))
}

/// Generate a random source port for TCP/UDP probes.
///
/// Drawn from the ephemeral range (49152-65535), which is less likely to
/// collide with well-known services on this host.
pub fn random_high_port() -> u16 {
    thread_rng().gen_range(49152..65535)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_high_port_stays_ephemeral() {
        for _ in 0..64 {
            let port = random_high_port();
            assert!(port >= 49152);
        }
    }
}
