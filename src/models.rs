use std::fmt;
use std::str::FromStr;

use pnet::packet::icmp::{IcmpCode, IcmpType};
use serde::{Deserialize, Serialize};

/// Probe protocols with real decision logic behind them
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("Unsupported protocol: {}", s)),
        }
    }
}

/// Port status enum
///
/// The rendered tokens are compared verbatim against operator expectations,
/// so the `open|filtered` spelling must survive every round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "skipped")]
    Skipped,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortStatus::Open => write!(f, "open"),
            PortStatus::Closed => write!(f, "closed"),
            PortStatus::Filtered => write!(f, "filtered"),
            PortStatus::OpenFiltered => write!(f, "open|filtered"),
            PortStatus::Error => write!(f, "error"),
            PortStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for PortStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(PortStatus::Open),
            "closed" => Ok(PortStatus::Closed),
            "filtered" => Ok(PortStatus::Filtered),
            "open|filtered" => Ok(PortStatus::OpenFiltered),
            "error" => Ok(PortStatus::Error),
            "skipped" => Ok(PortStatus::Skipped),
            _ => Err(format!("Invalid port status: {}", s)),
        }
    }
}

/// Verdict of one test case
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Pass => write!(f, "PASS"),
            TestStatus::Fail => write!(f, "FAIL"),
        }
    }
}

/// One declared firewall test case, as loaded from the case file.
///
/// `protocol` and `expected_result` stay as declared strings: the tester
/// folds them to lowercase before use, and an unsupported protocol must
/// survive loading so it can still be reported as a skipped row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub dest_ip: String,
    pub dest_port: u16,
    pub protocol: String,
    pub expected_result: String,
}

/// Outcome of one test case. Immutable once built; the reporter only reads.
///
/// `status` is `None` exactly when the case was skipped for an unsupported
/// protocol: the row is still listed, but takes part in no pass/fail count.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub dest_ip: String,
    pub dest_port: u16,
    pub protocol: String,
    pub expected_result: String,
    pub actual_result: PortStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TestStatus>,
}

/// Shape of whatever came back for a probe, stripped down to the fields
/// classification needs. Produced by the transport, consumed by `classify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResponse {
    /// A TCP segment attributed to the probe; flags as pnet reports them
    Tcp { flags: u16 },
    /// An ICMP message attributed to the probe
    Icmp {
        icmp_type: IcmpType,
        icmp_code: IcmpCode,
    },
    /// A UDP datagram from the probed port
    Udp { len: usize },
    /// Nothing matching arrived within the timeout window
    Timeout,
}
