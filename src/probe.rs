//! Raw-socket probe transport.
//!
//! One crafted packet out, at most one attributed response back within the
//! timeout. Responses for the probe protocol and ICMP errors are watched on
//! separate raw sockets; whichever matches the probe first wins. Opening the
//! sockets requires root/administrator privileges and there is no fallback:
//! a privilege failure surfaces as an error for the caller to classify.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, warn};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use pnet::transport::{
    ipv4_packet_iter, transport_channel, Ipv4TransportChannelIterator, TransportChannelType,
    TransportSender,
};
use rand::{thread_rng, Rng};
use tokio::time::sleep;

use crate::models::{Protocol, RawResponse};
use crate::utils;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// How long each receive poll blocks before the other socket gets a turn.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Seam between the tester and the wire.
///
/// Exactly one send and one bounded receive wait per invocation; a timeout
/// comes back as `RawResponse::Timeout`, not as an error.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn send_probe(
        &self,
        protocol: Protocol,
        dest_ip: Ipv4Addr,
        dest_port: u16,
    ) -> Result<RawResponse>;
}

/// Production transport backed by raw sockets.
pub struct RawSocketTransport {
    /// Source address for crafted packets; auto-detected per probe when unset
    local_ip: Option<Ipv4Addr>,
    timeout: Duration,
}

impl RawSocketTransport {
    pub fn new(local_ip: Option<Ipv4Addr>, timeout: Duration) -> Self {
        Self { local_ip, timeout }
    }
}

#[async_trait]
impl ProbeTransport for RawSocketTransport {
    async fn send_probe(
        &self,
        protocol: Protocol,
        dest_ip: Ipv4Addr,
        dest_port: u16,
    ) -> Result<RawResponse> {
        let local_ip = match self.local_ip {
            Some(ip) => ip,
            None => utils::find_local_ipv4().map_err(|e| {
                anyhow!(
                    "local IPv4 address required for raw probes and auto-detection failed: {}",
                    e
                )
            })?,
        };

        match protocol {
            Protocol::Tcp => tcp_probe(dest_ip, dest_port, local_ip, self.timeout).await,
            Protocol::Udp => udp_probe(dest_ip, dest_port, local_ip, self.timeout).await,
        }
    }
}

/// Creates an IPv4/TCP packet buffer and populates headers.
/// Requires a buffer slice large enough for IPv4 + TCP headers.
/// Returns the size of the constructed packet.
fn build_tcp_packet_v4(
    packet_buf: &mut [u8],
    source_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
    tcp_flags: u16,
    seq_num: u32,
    ack_num: u32,
) -> usize {
    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN;

    // Setup IP header
    {
        let mut ip_header = MutableIpv4Packet::new(&mut packet_buf[..total_len]).unwrap();
        ip_header.set_version(4);
        ip_header.set_header_length(5);
        ip_header.set_total_length(total_len as u16);
        ip_header.set_ttl(64);
        ip_header.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip_header.set_source(source_ip);
        ip_header.set_destination(dest_ip);
        ip_header.set_flags(Ipv4Flags::DontFragment);
        ip_header.set_identification(thread_rng().gen());
    }

    // Setup TCP header
    {
        let mut tcp_header =
            MutableTcpPacket::new(&mut packet_buf[IPV4_HEADER_LEN..total_len]).unwrap();
        tcp_header.set_source(source_port);
        tcp_header.set_destination(dest_port);
        tcp_header.set_sequence(seq_num);
        tcp_header.set_acknowledgement(ack_num);
        tcp_header.set_data_offset((TCP_HEADER_LEN / 4) as u8);
        tcp_header.set_flags(tcp_flags as u8);
        tcp_header.set_window(1024);
        tcp_header.set_urgent_ptr(0);
        tcp_header.set_checksum(0);
        let tcp_checksum =
            tcp::ipv4_checksum(&tcp_header.to_immutable(), &source_ip, &dest_ip);
        tcp_header.set_checksum(tcp_checksum);
    }

    // IP checksum last, over the finished header
    {
        let mut ip_header = MutableIpv4Packet::new(&mut packet_buf[..total_len]).unwrap();
        let checksum = ipv4::checksum(&ip_header.to_immutable());
        ip_header.set_checksum(checksum);
    }

    total_len
}

/// RST teardown packet for an observed SYN-ACK: sequence taken from the
/// peer's acknowledgement, acknowledgement from the peer's sequence + 1.
fn build_rst_packet_v4(
    packet_buf: &mut [u8],
    source_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
    peer_seq: u32,
    peer_ack: u32,
) -> usize {
    build_tcp_packet_v4(
        packet_buf,
        source_ip,
        dest_ip,
        source_port,
        dest_port,
        u16::from(TcpFlags::RST),
        peer_ack,
        peer_seq.wrapping_add(1),
    )
}

/// Creates an IPv4 packet carrying an empty UDP datagram.
/// Returns the size of the constructed packet.
fn build_udp_packet_v4(
    packet_buf: &mut [u8],
    source_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
) -> usize {
    let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN;

    {
        let mut ip_header = MutableIpv4Packet::new(&mut packet_buf[..total_len]).unwrap();
        ip_header.set_version(4);
        ip_header.set_header_length(5);
        ip_header.set_total_length(total_len as u16);
        ip_header.set_ttl(64);
        ip_header.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip_header.set_source(source_ip);
        ip_header.set_destination(dest_ip);
        ip_header.set_flags(Ipv4Flags::DontFragment);
        ip_header.set_identification(thread_rng().gen());
    }

    {
        let mut udp_header =
            MutableUdpPacket::new(&mut packet_buf[IPV4_HEADER_LEN..total_len]).unwrap();
        udp_header.set_source(source_port);
        udp_header.set_destination(dest_port);
        udp_header.set_length(UDP_HEADER_LEN as u16);
        udp_header.set_checksum(0);
        let udp_checksum =
            udp::ipv4_checksum(&udp_header.to_immutable(), &source_ip, &dest_ip);
        udp_header.set_checksum(udp_checksum);
    }

    {
        let mut ip_header = MutableIpv4Packet::new(&mut packet_buf[..total_len]).unwrap();
        let checksum = ipv4::checksum(&ip_header.to_immutable());
        ip_header.set_checksum(checksum);
    }

    total_len
}

/// Send one SYN probe and wait for the first attributed response.
///
/// On SYN-ACK the RST teardown goes out before the response is returned, so
/// no half-open connection is left on the target.
pub async fn tcp_probe(
    dest_ip: Ipv4Addr,
    dest_port: u16,
    local_ip: Ipv4Addr,
    timeout: Duration,
) -> Result<RawResponse> {
    let source_port = utils::random_high_port();
    let seq_num: u32 = thread_rng().gen();

    let (mut tx, mut rx) = transport_channel(
        4096,
        TransportChannelType::Layer3(IpNextHeaderProtocols::Tcp),
    )
    .map_err(|e| {
        anyhow!(
            "failed to open raw TCP socket (requires root/admin privileges): {}",
            e
        )
    })?;
    let (_icmp_tx, mut icmp_rx) = transport_channel(
        4096,
        TransportChannelType::Layer3(IpNextHeaderProtocols::Icmp),
    )
    .map_err(|e| {
        anyhow!(
            "failed to open raw ICMP socket (requires root/admin privileges): {}",
            e
        )
    })?;

    let mut packet_buf = [0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];
    let packet_len = build_tcp_packet_v4(
        &mut packet_buf,
        local_ip,
        dest_ip,
        source_port,
        dest_port,
        u16::from(TcpFlags::SYN),
        seq_num,
        0,
    );

    {
        let syn_packet = Ipv4Packet::new(&packet_buf[..packet_len]).unwrap();
        tx.send_to(syn_packet, IpAddr::V4(dest_ip))
            .map_err(|e| anyhow!("failed to send SYN probe to {}:{}: {}", dest_ip, dest_port, e))?;
    }
    debug!(
        "[TCP:{}:{}] Sent SYN from port {} ({} -> {})",
        dest_ip, dest_port, source_port, local_ip, dest_ip
    );

    let deadline = Instant::now() + timeout;
    let mut tcp_iter = ipv4_packet_iter(&mut rx);
    let mut icmp_iter = ipv4_packet_iter(&mut icmp_rx);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("[TCP:{}:{}] No response within {:?}", dest_ip, dest_port, timeout);
            return Ok(RawResponse::Timeout);
        }

        match tcp_iter.next_with_timeout(RECV_POLL_INTERVAL.min(remaining)) {
            Ok(Some((packet, addr))) => {
                if addr == IpAddr::V4(dest_ip) {
                    if let Some(tcp_packet) = TcpPacket::new(packet.payload()) {
                        if tcp_packet.get_source() == dest_port
                            && tcp_packet.get_destination() == source_port
                        {
                            let flags = u16::from(tcp_packet.get_flags());
                            let peer_seq = tcp_packet.get_sequence();
                            let peer_ack = tcp_packet.get_acknowledgement();
                            debug!(
                                "[TCP:{}:{}] Matched response, flags {:#05x}",
                                dest_ip, dest_port, flags
                            );
                            if flags == (u16::from(TcpFlags::SYN) | u16::from(TcpFlags::ACK)) {
                                send_rst(&mut tx, local_ip, dest_ip, source_port, dest_port, peer_seq, peer_ack);
                            }
                            return Ok(RawResponse::Tcp { flags });
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(anyhow!(
                    "error receiving TCP response from {}:{}: {}",
                    dest_ip,
                    dest_port,
                    e
                ))
            }
        }

        if let Some(response) =
            poll_icmp(&mut icmp_iter, dest_ip, dest_port, IpNextHeaderProtocols::Tcp)?
        {
            return Ok(response);
        }

        // Yield between poll slices so the runtime stays responsive.
        sleep(Duration::from_millis(1)).await;
    }
}

/// Send one empty UDP datagram and wait for the first attributed response.
pub async fn udp_probe(
    dest_ip: Ipv4Addr,
    dest_port: u16,
    local_ip: Ipv4Addr,
    timeout: Duration,
) -> Result<RawResponse> {
    let source_port = utils::random_high_port();

    let (mut tx, mut rx) = transport_channel(
        4096,
        TransportChannelType::Layer3(IpNextHeaderProtocols::Udp),
    )
    .map_err(|e| {
        anyhow!(
            "failed to open raw UDP socket (requires root/admin privileges): {}",
            e
        )
    })?;
    let (_icmp_tx, mut icmp_rx) = transport_channel(
        4096,
        TransportChannelType::Layer3(IpNextHeaderProtocols::Icmp),
    )
    .map_err(|e| {
        anyhow!(
            "failed to open raw ICMP socket (requires root/admin privileges): {}",
            e
        )
    })?;

    let mut packet_buf = [0u8; IPV4_HEADER_LEN + UDP_HEADER_LEN];
    let packet_len =
        build_udp_packet_v4(&mut packet_buf, local_ip, dest_ip, source_port, dest_port);

    {
        let udp_packet = Ipv4Packet::new(&packet_buf[..packet_len]).unwrap();
        tx.send_to(udp_packet, IpAddr::V4(dest_ip)).map_err(|e| {
            anyhow!("failed to send UDP probe to {}:{}: {}", dest_ip, dest_port, e)
        })?;
    }
    debug!(
        "[UDP:{}:{}] Sent empty datagram from port {} ({} -> {})",
        dest_ip, dest_port, source_port, local_ip, dest_ip
    );

    let deadline = Instant::now() + timeout;
    let mut udp_iter = ipv4_packet_iter(&mut rx);
    let mut icmp_iter = ipv4_packet_iter(&mut icmp_rx);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("[UDP:{}:{}] No response within {:?}", dest_ip, dest_port, timeout);
            return Ok(RawResponse::Timeout);
        }

        match udp_iter.next_with_timeout(RECV_POLL_INTERVAL.min(remaining)) {
            Ok(Some((packet, addr))) => {
                if addr == IpAddr::V4(dest_ip) {
                    if let Some(udp_packet) = UdpPacket::new(packet.payload()) {
                        if udp_packet.get_source() == dest_port
                            && udp_packet.get_destination() == source_port
                        {
                            let len = udp_packet.payload().len();
                            debug!(
                                "[UDP:{}:{}] Matched response, {} payload bytes",
                                dest_ip, dest_port, len
                            );
                            return Ok(RawResponse::Udp { len });
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(anyhow!(
                    "error receiving UDP response from {}:{}: {}",
                    dest_ip,
                    dest_port,
                    e
                ))
            }
        }

        if let Some(response) =
            poll_icmp(&mut icmp_iter, dest_ip, dest_port, IpNextHeaderProtocols::Udp)?
        {
            return Ok(response);
        }

        sleep(Duration::from_millis(1)).await;
    }
}

/// Fire-and-forget RST after a SYN-ACK. The port is already proven open, so
/// a failed teardown must not change the outcome.
fn send_rst(
    tx: &mut TransportSender,
    source_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
    peer_seq: u32,
    peer_ack: u32,
) {
    let mut packet_buf = [0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];
    let packet_len = build_rst_packet_v4(
        &mut packet_buf,
        source_ip,
        dest_ip,
        source_port,
        dest_port,
        peer_seq,
        peer_ack,
    );
    let rst_packet = Ipv4Packet::new(&packet_buf[..packet_len]).unwrap();
    match tx.send_to(rst_packet, IpAddr::V4(dest_ip)) {
        Ok(_) => debug!("[TCP:{}:{}] Sent RST teardown", dest_ip, dest_port),
        Err(e) => warn!("[TCP:{}:{}] Failed to send RST teardown: {}", dest_ip, dest_port, e),
    }
}

/// Poll the ICMP socket once and return a response if a message is
/// attributable to the in-flight probe.
fn poll_icmp(
    icmp_iter: &mut Ipv4TransportChannelIterator<'_>,
    dest_ip: Ipv4Addr,
    dest_port: u16,
    protocol: IpNextHeaderProtocol,
) -> Result<Option<RawResponse>> {
    match icmp_iter.next_with_timeout(RECV_POLL_INTERVAL) {
        Ok(Some((packet, _addr))) => {
            // Unreachables can originate from an intermediate filter, not the
            // target itself, so the outer source address is not checked;
            // attribution goes through the echoed original datagram.
            if let Some(icmp_packet) = IcmpPacket::new(packet.payload()) {
                let icmp_type = icmp_packet.get_icmp_type();
                let icmp_code = icmp_packet.get_icmp_code();
                if probe_echoed_in(&icmp_packet, dest_ip, dest_port, protocol) {
                    debug!(
                        "[ICMP:{}:{}] Matched type {:?} code {:?}",
                        dest_ip, dest_port, icmp_type, icmp_code
                    );
                    return Ok(Some(RawResponse::Icmp {
                        icmp_type,
                        icmp_code,
                    }));
                }
            }
            Ok(None)
        }
        Ok(None) => Ok(None),
        Err(e) => Err(anyhow!(
            "error receiving ICMP response for {}:{}: {}",
            dest_ip,
            dest_port,
            e
        )),
    }
}

/// Check whether an ICMP error echoes our probe.
///
/// The error payload is 4 unused bytes, then the original IP header plus at
/// least the first 8 bytes of its payload. The destination port sits at
/// offset 2..4 of the echoed transport header for both TCP and UDP.
fn probe_echoed_in(
    icmp_packet: &IcmpPacket<'_>,
    dest_ip: Ipv4Addr,
    dest_port: u16,
    protocol: IpNextHeaderProtocol,
) -> bool {
    let payload = icmp_packet.payload();
    if payload.len() < 4 + IPV4_HEADER_LEN {
        return false;
    }
    let inner = &payload[4..];
    let embedded = match Ipv4Packet::new(inner) {
        Some(p) => p,
        None => return false,
    };
    if embedded.get_destination() != dest_ip || embedded.get_next_level_protocol() != protocol {
        return false;
    }
    let header_len = embedded.get_header_length() as usize * 4;
    if inner.len() < header_len + 4 {
        return false;
    }
    let transport = &inner[header_len..];
    u16::from_be_bytes([transport[2], transport[3]]) == dest_port
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);

    #[test]
    fn syn_packet_carries_only_syn() {
        let mut buf = [0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];
        let len = build_tcp_packet_v4(
            &mut buf,
            SRC,
            DST,
            54321,
            443,
            u16::from(TcpFlags::SYN),
            0x1234_5678,
            0,
        );
        assert_eq!(len, 40);

        let ip = Ipv4Packet::new(&buf[..len]).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
        assert_eq!(ip.get_source(), SRC);
        assert_eq!(ip.get_destination(), DST);
        assert_ne!(ip.get_checksum(), 0);

        let tcp_segment = TcpPacket::new(&buf[IPV4_HEADER_LEN..len]).unwrap();
        assert_eq!(tcp_segment.get_source(), 54321);
        assert_eq!(tcp_segment.get_destination(), 443);
        assert_eq!(tcp_segment.get_sequence(), 0x1234_5678);
        assert_eq!(u16::from(tcp_segment.get_flags()), u16::from(TcpFlags::SYN));
        assert_ne!(tcp_segment.get_checksum(), 0);
    }

    #[test]
    fn rst_teardown_derives_numbers_from_syn_ack() {
        let peer_seq = 0xAABB_CCDD_u32;
        let peer_ack = 0x0102_0304_u32;
        let mut buf = [0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];
        let len = build_rst_packet_v4(&mut buf, SRC, DST, 54321, 443, peer_seq, peer_ack);

        let tcp_segment = TcpPacket::new(&buf[IPV4_HEADER_LEN..len]).unwrap();
        assert_eq!(u16::from(tcp_segment.get_flags()), u16::from(TcpFlags::RST));
        assert_eq!(tcp_segment.get_sequence(), peer_ack);
        assert_eq!(tcp_segment.get_acknowledgement(), peer_seq.wrapping_add(1));
    }

    #[test]
    fn udp_probe_is_an_empty_datagram() {
        let mut buf = [0u8; IPV4_HEADER_LEN + UDP_HEADER_LEN];
        let len = build_udp_packet_v4(&mut buf, SRC, DST, 54321, 53);
        assert_eq!(len, 28);

        let ip = Ipv4Packet::new(&buf[..len]).unwrap();
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Udp);

        let udp_datagram = UdpPacket::new(&buf[IPV4_HEADER_LEN..len]).unwrap();
        assert_eq!(udp_datagram.get_source(), 54321);
        assert_eq!(udp_datagram.get_destination(), 53);
        assert_eq!(udp_datagram.get_length(), UDP_HEADER_LEN as u16);
        assert!(udp_datagram.payload().is_empty());
    }

    #[test]
    fn icmp_attribution_requires_matching_echo() {
        // Hand-assemble a destination-unreachable whose echoed datagram is a
        // UDP probe to DST:53.
        let mut probe = [0u8; IPV4_HEADER_LEN + UDP_HEADER_LEN];
        let probe_len = build_udp_packet_v4(&mut probe, SRC, DST, 54321, 53);

        let mut icmp_buf = vec![0u8; 4 + 4 + probe_len];
        icmp_buf[0] = 3; // destination unreachable
        icmp_buf[1] = 3; // port unreachable
        icmp_buf[8..8 + probe_len].copy_from_slice(&probe[..probe_len]);
        let icmp_packet = IcmpPacket::new(&icmp_buf).unwrap();

        assert!(probe_echoed_in(&icmp_packet, DST, 53, IpNextHeaderProtocols::Udp));
        // Wrong port, wrong protocol, wrong target: all rejected.
        assert!(!probe_echoed_in(&icmp_packet, DST, 54, IpNextHeaderProtocols::Udp));
        assert!(!probe_echoed_in(&icmp_packet, DST, 53, IpNextHeaderProtocols::Tcp));
        assert!(!probe_echoed_in(&icmp_packet, SRC, 53, IpNextHeaderProtocols::Udp));
    }
}
