//! Pure classification of probe responses into port states.
//!
//! No I/O happens here: the transport hands over a [`RawResponse`] and the
//! functions below map it to a [`PortStatus`] deterministically. Ambiguous
//! traffic is resolved conservatively (`filtered` for TCP, `open|filtered`
//! for UDP) and is never treated as proof of an open or closed port.

use pnet::packet::icmp::{destination_unreachable, IcmpTypes};
use pnet::packet::tcp::TcpFlags;

use crate::models::{PortStatus, Protocol, RawResponse};

/// Classify a response for the protocol that was probed.
pub fn classify(protocol: Protocol, response: &RawResponse) -> PortStatus {
    match protocol {
        Protocol::Tcp => classify_tcp(response),
        Protocol::Udp => classify_udp(response),
    }
}

/// SYN-probe semantics: only an exact SYN-ACK proves open and only an exact
/// RST-ACK proves closed.
///
/// ICMP unreachable variants (type 3, codes 1/2/3/9/10/13: host, protocol or
/// port unreachable, and the administratively-prohibited family) indicate a
/// filtering device, and so does silence or any response shape not matched
/// above, so all of those collapse onto `filtered`.
pub fn classify_tcp(response: &RawResponse) -> PortStatus {
    let syn_ack = u16::from(TcpFlags::SYN) | u16::from(TcpFlags::ACK);
    let rst_ack = u16::from(TcpFlags::RST) | u16::from(TcpFlags::ACK);

    match response {
        RawResponse::Tcp { flags } if *flags == syn_ack => PortStatus::Open,
        RawResponse::Tcp { flags } if *flags == rst_ack => PortStatus::Closed,
        _ => PortStatus::Filtered,
    }
}

/// UDP-probe semantics: silence is inherently ambiguous (an open port may
/// discard the empty datagram, or a filter may have dropped the probe), so
/// absence of a reply and every unexpected shape resolve to `open|filtered`.
/// Only an ICMP port-unreachable proves closed, and only a UDP reply from
/// the probed port proves open.
pub fn classify_udp(response: &RawResponse) -> PortStatus {
    match response {
        RawResponse::Icmp {
            icmp_type,
            icmp_code,
        } if *icmp_type == IcmpTypes::DestinationUnreachable
            && *icmp_code
                == destination_unreachable::IcmpCodes::DestinationPortUnreachable =>
        {
            PortStatus::Closed
        }
        RawResponse::Udp { .. } => PortStatus::Open,
        _ => PortStatus::OpenFiltered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::icmp::IcmpCode;

    fn syn_ack() -> RawResponse {
        RawResponse::Tcp {
            flags: u16::from(TcpFlags::SYN) | u16::from(TcpFlags::ACK),
        }
    }

    fn rst_ack() -> RawResponse {
        RawResponse::Tcp {
            flags: u16::from(TcpFlags::RST) | u16::from(TcpFlags::ACK),
        }
    }

    fn unreachable(code: u8) -> RawResponse {
        RawResponse::Icmp {
            icmp_type: IcmpTypes::DestinationUnreachable,
            icmp_code: IcmpCode(code),
        }
    }

    #[test]
    fn tcp_syn_ack_is_open() {
        assert_eq!(classify_tcp(&syn_ack()), PortStatus::Open);
    }

    #[test]
    fn tcp_rst_ack_is_closed() {
        assert_eq!(classify_tcp(&rst_ack()), PortStatus::Closed);
    }

    #[test]
    fn tcp_timeout_is_filtered() {
        assert_eq!(classify_tcp(&RawResponse::Timeout), PortStatus::Filtered);
    }

    #[test]
    fn tcp_flag_match_is_exact() {
        // SYN-ACK-PSH and a bare RST are not the handshake answers the
        // contract names, so both fall through to filtered.
        let extra = u16::from(TcpFlags::SYN) | u16::from(TcpFlags::ACK) | u16::from(TcpFlags::PSH);
        assert_eq!(
            classify_tcp(&RawResponse::Tcp { flags: extra }),
            PortStatus::Filtered
        );
        assert_eq!(
            classify_tcp(&RawResponse::Tcp {
                flags: u16::from(TcpFlags::RST)
            }),
            PortStatus::Filtered
        );
    }

    #[test]
    fn tcp_icmp_unreachable_is_filtered() {
        for code in [1, 2, 3, 9, 10, 13] {
            assert_eq!(classify_tcp(&unreachable(code)), PortStatus::Filtered);
        }
    }

    #[test]
    fn tcp_unexpected_shapes_are_filtered() {
        assert_eq!(
            classify_tcp(&RawResponse::Udp { len: 12 }),
            PortStatus::Filtered
        );
        assert_eq!(
            classify_tcp(&RawResponse::Icmp {
                icmp_type: IcmpTypes::TimeExceeded,
                icmp_code: IcmpCode(0),
            }),
            PortStatus::Filtered
        );
    }

    #[test]
    fn udp_timeout_is_open_filtered() {
        assert_eq!(
            classify_udp(&RawResponse::Timeout),
            PortStatus::OpenFiltered
        );
    }

    #[test]
    fn udp_port_unreachable_is_closed() {
        assert_eq!(classify_udp(&unreachable(3)), PortStatus::Closed);
    }

    #[test]
    fn udp_other_unreachable_codes_stay_ambiguous() {
        for code in [1, 2, 9, 10, 13] {
            assert_eq!(classify_udp(&unreachable(code)), PortStatus::OpenFiltered);
        }
    }

    #[test]
    fn udp_reply_is_open() {
        assert_eq!(
            classify_udp(&RawResponse::Udp { len: 0 }),
            PortStatus::Open
        );
    }

    #[test]
    fn udp_unexpected_tcp_segment_stays_ambiguous() {
        assert_eq!(classify_udp(&syn_ack()), PortStatus::OpenFiltered);
    }

    #[test]
    fn classification_is_idempotent() {
        let captured = syn_ack();
        assert_eq!(
            classify(Protocol::Tcp, &captured),
            classify(Protocol::Tcp, &captured)
        );
        let silent = RawResponse::Timeout;
        assert_eq!(
            classify(Protocol::Udp, &silent),
            classify(Protocol::Udp, &silent)
        );
    }
}
