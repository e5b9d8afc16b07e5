// src/packet.rs
// Babel packet framing, the TLV <-> event translation layer, and the
// per-neighbor send buffers with interval-based flushing.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use crate::event::{OutboundEvent, ProtocolEvent};
use crate::routing::RouteKey;
use crate::tlv::{Tlv, TlvError, HELLO_FLAG_UNICAST};
use crate::util::Timestamp;

/// Babel default port and multicast group addresses.
pub const BABEL_PORT: u16 = 6696;
pub const MULTICAST_V4_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 111);
pub const MULTICAST_V6_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0006);

/// A Babel packet: header plus a sequence of TLVs.
pub struct Packet {
    tlvs: Vec<Tlv>,
}

impl Packet {
    pub const MAGIC: u8 = 42;
    pub const VERSION: u8 = 2;

    pub fn with_tlvs(tlvs: Vec<Tlv>) -> Self {
        Packet { tlvs }
    }

    pub fn tlvs(&self) -> &[Tlv] {
        &self.tlvs
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let body: Vec<u8> = self.tlvs.iter().flat_map(|t| t.to_bytes()).collect();
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.push(Self::MAGIC);
        buf.push(Self::VERSION);
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, TlvError> {
        if buf.len() < 4 || buf[0] != Self::MAGIC || buf[1] != Self::VERSION {
            return Err(TlvError::Truncated);
        }
        let body_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if 4 + body_len > buf.len() {
            return Err(TlvError::Overrun);
        }
        let tlvs = Tlv::parse_all(&buf[4..4 + body_len])?;
        Ok(Packet { tlvs })
    }
}

/// Result of translating one packet into protocol events.
#[derive(Debug, Default)]
pub struct DecodedPacket {
    pub events: Vec<ProtocolEvent>,
    /// TLVs dropped for lacking context or being unintelligible.
    pub violations: usize,
}

/// Translate parsed TLVs into protocol events, applying the
/// packet-scoped router-id context to updates and requests.
pub fn decode_events(tlvs: Vec<Tlv>) -> DecodedPacket {
    let mut out = DecodedPacket::default();
    let mut router_id: Option<[u8; 8]> = None;

    for tlv in tlvs {
        match tlv {
            Tlv::Hello {
                flags,
                seqno,
                interval,
            } => out.events.push(ProtocolEvent::Hello {
                seqno,
                interval,
                unicast: flags & HELLO_FLAG_UNICAST != 0,
            }),
            Tlv::Ihu {
                rxcost,
                interval,
                address,
            } => out.events.push(ProtocolEvent::Ihu {
                rxcost,
                interval,
                address,
            }),
            Tlv::RouterId { router_id: rid } => router_id = Some(rid),
            Tlv::Update {
                interval,
                seqno,
                metric,
                prefix,
                plen,
                src_prefix,
                src_plen,
                tos,
                ..
            } => match router_id {
                Some(rid) => out.events.push(ProtocolEvent::Update {
                    router_id: rid,
                    key: RouteKey {
                        prefix,
                        plen,
                        src_prefix,
                        src_plen,
                        tos,
                    },
                    seqno,
                    metric,
                    interval,
                }),
                // An update without router-id context is a protocol
                // violation.
                None => out.violations += 1,
            },
            Tlv::RouteRequest {
                prefix,
                src_prefix,
                src_plen,
                tos,
            } => out.events.push(ProtocolEvent::RouteRequest {
                key: prefix.map(|(prefix, plen)| RouteKey {
                    prefix,
                    plen,
                    src_prefix,
                    src_plen,
                    tos,
                }),
            }),
            Tlv::SeqnoRequest {
                seqno,
                hop_count,
                router_id: rid,
                prefix,
                plen,
                src_prefix,
                src_plen,
                tos,
            } => out.events.push(ProtocolEvent::SeqnoRequest {
                router_id: rid,
                key: RouteKey {
                    prefix,
                    plen,
                    src_prefix,
                    src_plen,
                    tos,
                },
                seqno,
                hop_count,
            }),
            Tlv::Ack { opaque } => out.events.push(ProtocolEvent::Ack { opaque }),
            Tlv::AckRequest { .. } | Tlv::NextHop { .. } | Tlv::Pad1 | Tlv::PadN { .. } => {}
            Tlv::Unknown { .. } => out.violations += 1,
        }
    }

    out
}

/// Serialise an outbound event into the TLVs that express it. Updates
/// are preceded by their RouterId TLV.
pub fn encode_outbound(ev: &OutboundEvent) -> Vec<Tlv> {
    match ev {
        OutboundEvent::Update {
            router_id,
            key,
            seqno,
            metric,
            ..
        } => vec![
            Tlv::RouterId {
                router_id: *router_id,
            },
            Tlv::Update {
                flags: 0,
                interval: 400,
                seqno: *seqno,
                metric: *metric,
                prefix: key.prefix,
                plen: key.plen,
                src_prefix: key.src_prefix,
                src_plen: key.src_plen,
                tos: key.tos,
            },
        ],
        OutboundEvent::SeqnoRequest {
            router_id,
            key,
            seqno,
            hop_count,
            ..
        } => vec![Tlv::SeqnoRequest {
            seqno: *seqno,
            hop_count: *hop_count,
            router_id: *router_id,
            prefix: key.prefix,
            plen: key.plen,
            src_prefix: key.src_prefix,
            src_plen: key.src_plen,
            tos: key.tos,
        }],
        OutboundEvent::Ihu {
            addr,
            rxcost,
            interval,
            ..
        } => vec![Tlv::Ihu {
            rxcost: *rxcost,
            interval: *interval,
            address: Some(*addr),
        }],
        OutboundEvent::Hello {
            dest,
            seqno,
            interval,
        } => {
            let flags = match dest {
                crate::event::Destination::Unicast { .. } => HELLO_FLAG_UNICAST,
                crate::event::Destination::Multicast { .. } => 0,
            };
            vec![Tlv::Hello {
                flags,
                seqno: *seqno,
                interval: *interval,
            }]
        }
    }
}

/// Accumulates TLVs bound for one peer until the buffer fills or the
/// flush interval passes.
#[derive(Debug)]
pub struct SendBuffer {
    tlvs: Vec<Tlv>,
    bytes: usize,
    capacity: usize,
    flush_interval_ms: u16,
    last_flush: Timestamp,
}

impl SendBuffer {
    pub fn new(capacity: usize, flush_interval_ms: u16) -> Self {
        SendBuffer {
            tlvs: Vec::new(),
            bytes: 0,
            capacity,
            flush_interval_ms,
            last_flush: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tlvs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tlvs.len()
    }

    /// Queue a TLV. Returns true when the buffer is full and should be
    /// flushed immediately.
    pub fn push(&mut self, tlv: Tlv) -> bool {
        self.bytes += tlv.to_bytes().len();
        self.tlvs.push(tlv);
        self.bytes + 4 >= self.capacity
    }

    /// Whether the periodic flush is due.
    pub fn due(&self, now: Timestamp) -> bool {
        !self.tlvs.is_empty()
            && now.saturating_sub(self.last_flush) >= self.flush_interval_ms as u64
    }

    /// Drain the buffer into a framed packet.
    pub fn flush(&mut self, now: Timestamp) -> Option<Vec<u8>> {
        if self.tlvs.is_empty() {
            return None;
        }
        self.last_flush = now;
        self.bytes = 0;
        let tlvs = std::mem::take(&mut self.tlvs);
        Some(Packet::with_tlvs(tlvs).to_bytes())
    }
}

/// Bind the Babel UDP socket and join the IPv4 multicast group on
/// `iface`.
pub fn bind_multicast_v4(iface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, BABEL_PORT))?;
    socket.join_multicast_v4(&MULTICAST_V4_ADDR, &iface)?;
    socket.set_multicast_loop_v4(false)?;
    Ok(socket)
}

/// Bind the Babel UDP socket and join the IPv6 multicast group on the
/// interface with index `ifindex`.
pub fn bind_multicast_v6(ifindex: u32) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, BABEL_PORT))?;
    socket.join_multicast_v6(&MULTICAST_V6_ADDR, ifindex)?;
    socket.set_multicast_loop_v6(false)?;
    Ok(socket)
}

/// Send a framed packet; failures are reported to the caller, which
/// drops the packet and relies on the next scheduled emission.
pub fn send_packet<A: ToSocketAddrs>(socket: &UdpSocket, buf: &[u8], dest: A) -> io::Result<usize> {
    socket.send_to(buf, dest)
}

/// Receive and frame-check one packet.
pub fn recv_packet(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(Packet, SocketAddr)> {
    let (amt, src) = socket.recv_from(buf)?;
    let pkt = Packet::from_bytes(&buf[..amt])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((pkt, src))
}
