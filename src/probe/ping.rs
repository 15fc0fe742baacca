//! Ping probe implementation with native ICMP and command fallback.
//!
//! Native ICMP runs blocking sockets inside spawn_blocking. Hosts without raw or
//! datagram ICMP permission shell out to the platform `ping` tool instead.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier/sequence pair so concurrent pings to one host can be told apart.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn open_icmp_socket(ip: IpAddr) -> std::io::Result<Socket> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged on macOS and on Linux
    // when ping_group_range allows it.
    Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
}

fn detect_icmp_capability() -> IcmpCapability {
    let probe_ip = IpAddr::from([127, 0, 0, 1]);
    if open_icmp_socket(probe_ip).is_ok() {
        tracing::info!("Ping probe: using native ICMP sockets");
        IcmpCapability::Native
    } else {
        tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
        IcmpCapability::CommandOnly
    }
}

/// Ping `address` once and return the round-trip time.
///
/// `ProbeError::Timeout` means no reply arrived; every other error means the
/// probe itself could not be carried out.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        return match result {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
                run_ping_command(address, timeout).await
            }
            other => other,
        };
    }

    run_ping_command(address, timeout).await
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Send one echo request and wait for the matching reply.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let socket = open_icmp_socket(ip)
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let (packet, reply_type) = match ip {
        IpAddr::V4(_) => (build_echo_request(ICMPV4_ECHO_REQUEST, identifier, sequence), ICMPV4_ECHO_REPLY),
        IpAddr::V6(_) => (build_echo_request(ICMPV6_ECHO_REQUEST, identifier, sequence), ICMPV6_ECHO_REPLY),
    };

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Other pings share the socket type; keep reading until ours shows up.
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized the first `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_matching_reply(buf, ip.is_ipv4(), reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Check whether a received datagram is the echo reply we are waiting for.
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message.
fn is_matching_reply(buf: &[u8], ipv4: bool, reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = if ipv4 && !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };

    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    icmp[0] == reply_type && reply_id == identifier && reply_seq == sequence
}

/// Build an echo request: 8 byte header plus 56 byte payload.
///
/// The ICMPv6 checksum is filled in by the kernel, so only v4 computes one.
fn build_echo_request(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = icmp_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if icmp_type == ICMPV4_ECHO_REQUEST {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(windows)]
fn ping_command_args(address: &str, timeout: Duration) -> Vec<String> {
    let timeout_ms = timeout.as_millis().max(1);
    vec!["-n".into(), "1".into(), "-w".into(), timeout_ms.to_string(), address.into()]
}

#[cfg(not(windows))]
fn ping_command_args(address: &str, timeout: Duration) -> Vec<String> {
    let timeout_secs = timeout.as_secs().max(1);
    vec!["-c".into(), "1".into(), "-W".into(), timeout_secs.to_string(), address.into()]
}

/// Run ping via the system command.
///
/// The child is killed if the caller stops waiting, so a hung `ping` never
/// outlives its probe.
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let start = Instant::now();

    let output = Command::new("ping")
        .args(ping_command_args(address, timeout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || is_total_loss(&stdout) {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}{}", stdout, stderr)));
    }

    // Windows exits 0 for "Destination host unreachable" replies from a router.
    if !has_echo_reply(&stdout) {
        return Err(ProbeError::Timeout(timeout));
    }

    Ok(parse_ping_latency(&stdout).unwrap_or_else(|| start.elapsed()))
}

fn is_total_loss(output: &str) -> bool {
    output.contains("100% packet loss") || output.contains("100.0% packet loss") || output.contains("(100% loss)")
}

/// A genuine echo reply carries a TTL on every platform's ping output.
fn has_echo_reply(output: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)\bttl[=:]\s*\d+").expect("valid regex"));
    re.is_match(output)
}

/// Parse the per-packet round trip, e.g. `time=12.3 ms` or `time<1ms`.
fn parse_ping_latency(output: &str) -> Option<Duration> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)time[=<](?P<val>[0-9.]+)\s*ms").expect("valid regex"));

    let ms: f64 = re.captures(output)?.name("val")?.as_str().parse().ok()?;
    Some(Duration::from_secs_f64(ms / 1000.0))
}
