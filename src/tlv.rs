//! Babel TLV parsing and serialization (RFC 8966), extended with the
//! source-prefix sub-TLV of RFC 9079 and a TOS sub-TLV qualifying
//! routes by DSCP class.
//!
//! Addresses are decoded to canonical 16-byte form: AE 1 (IPv4) maps
//! into `::ffff:0:0/96`, AE 3 (link-local) expands under `fe80::/64`.
//! Prefix lengths are canonicalized the same way, so an IPv4 /24
//! becomes /120 here and is compressed back on the wire.
//!
//! Sub-TLV types 128 and above are mandatory: a TLV carrying an
//! unknown mandatory sub-TLV is delivered as [`Tlv::Unknown`] so the
//! caller drops it without losing the rest of the packet.

use std::io::{Cursor, Read};
use std::net::Ipv6Addr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::tos::Tos;
use crate::util::RouterId;

pub const AE_WILDCARD: u8 = 0;
pub const AE_IPV4: u8 = 1;
pub const AE_IPV6: u8 = 2;
pub const AE_LINKLOCAL: u8 = 3;

const SUBTLV_PAD1: u8 = 0;
const SUBTLV_PADN: u8 = 1;
/// RFC 9079 source prefix; mandatory.
const SUBTLV_SOURCE_PREFIX: u8 = 128;
/// DSCP qualifier; mandatory, a receiver that cannot classify must
/// not mistake the route for the unqualified one.
const SUBTLV_TOS: u8 = 130;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("truncated TLV")]
    Truncated,
    #[error("TLV length exceeds buffer")]
    Overrun,
    #[error("unsupported address encoding {0}")]
    BadAe(u8),
    #[error("invalid prefix length {0}")]
    BadPrefix(u8),
    #[error("compressed prefix without preceding update")]
    NoDefaultPrefix,
    #[error("unknown mandatory sub-TLV {0}")]
    MandatorySubTlv(u8),
}

/// A Babel TLV with addresses in canonical form.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Tlv {
    Pad1,
    PadN {
        n: u8,
    },
    AckRequest {
        opaque: u16,
        interval: u16,
    },
    Ack {
        opaque: u16,
    },
    Hello {
        flags: u16,
        seqno: u16,
        interval: u16,
    },
    Ihu {
        rxcost: u16,
        interval: u16,
        address: Option<Ipv6Addr>,
    },
    RouterId {
        router_id: RouterId,
    },
    NextHop {
        address: Ipv6Addr,
    },
    Update {
        flags: u8,
        interval: u16,
        seqno: u16,
        metric: u16,
        prefix: Ipv6Addr,
        plen: u8,
        src_prefix: Ipv6Addr,
        src_plen: u8,
        tos: Tos,
    },
    RouteRequest {
        /// `None` asks for a full dump.
        prefix: Option<(Ipv6Addr, u8)>,
        src_prefix: Ipv6Addr,
        src_plen: u8,
        tos: Tos,
    },
    SeqnoRequest {
        seqno: u16,
        hop_count: u8,
        router_id: RouterId,
        prefix: Ipv6Addr,
        plen: u8,
        src_prefix: Ipv6Addr,
        src_plen: u8,
        tos: Tos,
    },
    Unknown {
        tlv_type: u8,
        data: Vec<u8>,
    },
}

/// Hello flag: sent over unicast.
pub const HELLO_FLAG_UNICAST: u16 = 0x8000;

const V4_UNSPEC: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0xFFFF, 0, 0);
const UNSPEC: Ipv6Addr = Ipv6Addr::UNSPECIFIED;

/// Decoder state carried across one packet: the compression context
/// for omitted prefix bytes, one per address family.
#[derive(Debug, Default)]
pub struct PrefixContext {
    v4: Option<[u8; 16]>,
    v6: Option<[u8; 16]>,
}

impl PrefixContext {
    fn get(&self, ae: u8) -> Option<&[u8; 16]> {
        match ae {
            AE_IPV4 => self.v4.as_ref(),
            AE_IPV6 => self.v6.as_ref(),
            _ => None,
        }
    }

    fn set(&mut self, ae: u8, octets: [u8; 16]) {
        match ae {
            AE_IPV4 => self.v4 = Some(octets),
            AE_IPV6 => self.v6 = Some(octets),
            _ => {}
        }
    }
}

fn rd_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, TlvError> {
    cur.read_u8().map_err(|_| TlvError::Truncated)
}

fn rd_u16(cur: &mut Cursor<&[u8]>) -> Result<u16, TlvError> {
    cur.read_u16::<BigEndian>().map_err(|_| TlvError::Truncated)
}

fn rd_bytes(cur: &mut Cursor<&[u8]>, n: usize) -> Result<Vec<u8>, TlvError> {
    let mut buf = vec![0u8; n];
    cur.read_exact(&mut buf).map_err(|_| TlvError::Truncated)?;
    Ok(buf)
}

fn is_v4_mapped(addr: &Ipv6Addr) -> bool {
    matches!(addr.octets(), [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, ..])
}

/// Number of canonical-plen bits the AE does not carry on the wire.
fn ae_bias(ae: u8) -> u8 {
    if ae == AE_IPV4 {
        96
    } else {
        0
    }
}

/// Decode a possibly-compressed prefix into canonical form.
fn decode_prefix(
    ae: u8,
    wire_plen: u8,
    omitted: u8,
    cur: &mut Cursor<&[u8]>,
    ctx: &PrefixContext,
) -> Result<(Ipv6Addr, u8), TlvError> {
    let max_plen = match ae {
        AE_IPV4 => 32,
        AE_IPV6 => 128,
        other => return Err(TlvError::BadAe(other)),
    };
    if wire_plen > max_plen {
        return Err(TlvError::BadPrefix(wire_plen));
    }

    let total = (wire_plen as usize + 7) / 8;
    if (omitted as usize) > total {
        return Err(TlvError::BadPrefix(omitted));
    }
    let carried = rd_bytes(cur, total - omitted as usize)?;

    let mut octets = [0u8; 16];
    let base = if ae == AE_IPV4 {
        octets[10] = 0xFF;
        octets[11] = 0xFF;
        12
    } else {
        0
    };

    if omitted > 0 {
        let default = ctx.get(ae).ok_or(TlvError::NoDefaultPrefix)?;
        octets[base..base + omitted as usize]
            .copy_from_slice(&default[base..base + omitted as usize]);
    }
    octets[base + omitted as usize..base + total].copy_from_slice(&carried);

    Ok((Ipv6Addr::from(octets), wire_plen + ae_bias(ae)))
}

/// Decode an IHU/NextHop address for the given AE.
fn decode_address(ae: u8, cur: &mut Cursor<&[u8]>) -> Result<Option<Ipv6Addr>, TlvError> {
    match ae {
        AE_WILDCARD => Ok(None),
        AE_IPV4 => {
            let b = rd_bytes(cur, 4)?;
            let mut octets = [0u8; 16];
            octets[10] = 0xFF;
            octets[11] = 0xFF;
            octets[12..].copy_from_slice(&b);
            Ok(Some(Ipv6Addr::from(octets)))
        }
        AE_IPV6 => {
            let b = rd_bytes(cur, 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b);
            Ok(Some(Ipv6Addr::from(octets)))
        }
        AE_LINKLOCAL => {
            let b = rd_bytes(cur, 8)?;
            let mut octets = [0u8; 16];
            octets[0] = 0xFE;
            octets[1] = 0x80;
            octets[8..].copy_from_slice(&b);
            Ok(Some(Ipv6Addr::from(octets)))
        }
        other => Err(TlvError::BadAe(other)),
    }
}

/// Source prefix and TOS recovered from a TLV's trailing sub-TLVs.
#[derive(Debug, Default, PartialEq, Eq)]
struct SubTlvs {
    src_prefix: Option<(Ipv6Addr, u8)>,
    tos: Option<Tos>,
}

fn parse_subtlvs(ae: u8, buf: &[u8]) -> Result<SubTlvs, TlvError> {
    let mut out = SubTlvs::default();
    let mut cur = Cursor::new(buf);

    while (cur.position() as usize) < buf.len() {
        let stype = rd_u8(&mut cur)?;
        if stype == SUBTLV_PAD1 {
            continue;
        }
        let slen = rd_u8(&mut cur)? as usize;
        let data = rd_bytes(&mut cur, slen)?;

        match stype {
            SUBTLV_PADN => {}
            SUBTLV_SOURCE_PREFIX => {
                let mut scur = Cursor::new(data.as_slice());
                let wire_plen = rd_u8(&mut scur)?;
                let ctx = PrefixContext::default();
                let (prefix, plen) = decode_prefix(ae, wire_plen, 0, &mut scur, &ctx)?;
                out.src_prefix = Some((prefix, plen));
            }
            SUBTLV_TOS => {
                let tos = *data.first().ok_or(TlvError::Truncated)?;
                out.tos = Some(Tos(tos));
            }
            other if other >= 128 => return Err(TlvError::MandatorySubTlv(other)),
            _ => {}
        }
    }

    Ok(out)
}

fn encode_subtlvs(buf: &mut Vec<u8>, ae: u8, src_prefix: &Ipv6Addr, src_plen: u8, tos: Tos) {
    if src_plen > 0 {
        let wire_plen = src_plen - ae_bias(ae);
        let bytes = (wire_plen as usize + 7) / 8;
        let octets = src_prefix.octets();
        let base = if ae == AE_IPV4 { 12 } else { 0 };
        buf.push(SUBTLV_SOURCE_PREFIX);
        buf.push(1 + bytes as u8);
        buf.push(wire_plen);
        buf.extend_from_slice(&octets[base..base + bytes]);
    }
    if !tos.is_default() {
        buf.push(SUBTLV_TOS);
        buf.push(1);
        buf.push(tos.0);
    }
}

/// Pick the wire AE for a canonical address.
fn ae_of(addr: &Ipv6Addr) -> u8 {
    if is_v4_mapped(addr) {
        AE_IPV4
    } else {
        AE_IPV6
    }
}

impl Tlv {
    /// Parse every TLV in `buf`.
    ///
    /// Structural errors abort the packet; a TLV carrying an unknown
    /// mandatory sub-TLV degrades to [`Tlv::Unknown`] instead.
    pub fn parse_all(buf: &[u8]) -> Result<Vec<Tlv>, TlvError> {
        let mut out = Vec::new();
        let mut cur = Cursor::new(buf);
        let mut ctx = PrefixContext::default();
        while (cur.position() as usize) < buf.len() {
            out.push(Tlv::parse(&mut cur, &mut ctx)?);
        }
        Ok(out)
    }

    /// Parse a single TLV at the cursor position, advancing the
    /// cursor. `ctx` carries the prefix compression state of the
    /// enclosing packet.
    pub fn parse(cur: &mut Cursor<&[u8]>, ctx: &mut PrefixContext) -> Result<Tlv, TlvError> {
        let t = rd_u8(cur)?;
        if t == 0 {
            return Ok(Tlv::Pad1);
        }
        let length = rd_u8(cur)? as usize;
        let pos = cur.position() as usize;
        if pos + length > cur.get_ref().len() {
            return Err(TlvError::Overrun);
        }
        let payload = cur.get_ref()[pos..pos + length].to_vec();
        cur.set_position((pos + length) as u64);

        let result = Tlv::parse_body(t, &payload, ctx);
        match result {
            Ok(tlv) => Ok(tlv),
            // Drop just this TLV, keep the packet.
            Err(TlvError::MandatorySubTlv(_)) => Ok(Tlv::Unknown {
                tlv_type: t,
                data: payload,
            }),
            Err(e) => Err(e),
        }
    }

    fn parse_body(t: u8, payload: &[u8], ctx: &mut PrefixContext) -> Result<Tlv, TlvError> {
        let mut p = Cursor::new(payload);
        let tlv = match t {
            1 => Tlv::PadN {
                n: payload.len() as u8,
            },
            2 => {
                rd_u16(&mut p)?; // reserved
                let opaque = rd_u16(&mut p)?;
                let interval = rd_u16(&mut p)?;
                Tlv::AckRequest { opaque, interval }
            }
            3 => {
                let opaque = rd_u16(&mut p)?;
                Tlv::Ack { opaque }
            }
            4 => {
                let flags = rd_u16(&mut p)?;
                let seqno = rd_u16(&mut p)?;
                let interval = rd_u16(&mut p)?;
                Tlv::Hello {
                    flags,
                    seqno,
                    interval,
                }
            }
            5 => {
                let ae = rd_u8(&mut p)?;
                rd_u8(&mut p)?; // reserved
                let rxcost = rd_u16(&mut p)?;
                let interval = rd_u16(&mut p)?;
                let address = decode_address(ae, &mut p)?;
                Tlv::Ihu {
                    rxcost,
                    interval,
                    address,
                }
            }
            6 => {
                rd_u16(&mut p)?; // reserved
                let bytes = rd_bytes(&mut p, 8)?;
                let mut router_id = [0u8; 8];
                router_id.copy_from_slice(&bytes);
                Tlv::RouterId { router_id }
            }
            7 => {
                let ae = rd_u8(&mut p)?;
                rd_u8(&mut p)?; // reserved
                let address = decode_address(ae, &mut p)?.ok_or(TlvError::BadAe(ae))?;
                Tlv::NextHop { address }
            }
            8 => {
                let ae = rd_u8(&mut p)?;
                let flags = rd_u8(&mut p)?;
                let wire_plen = rd_u8(&mut p)?;
                let omitted = rd_u8(&mut p)?;
                let interval = rd_u16(&mut p)?;
                let seqno = rd_u16(&mut p)?;
                let metric = rd_u16(&mut p)?;
                let (prefix, plen) = decode_prefix(ae, wire_plen, omitted, &mut p, ctx)?;
                ctx.set(ae, prefix.octets());
                let subs = parse_subtlvs(ae, &payload[p.position() as usize..])?;
                let (src_prefix, src_plen) = subs
                    .src_prefix
                    .unwrap_or((if ae == AE_IPV4 { V4_UNSPEC } else { UNSPEC }, 0));
                Tlv::Update {
                    flags,
                    interval,
                    seqno,
                    metric,
                    prefix,
                    plen,
                    src_prefix,
                    src_plen,
                    tos: subs.tos.unwrap_or(Tos::DEFAULT),
                }
            }
            9 => {
                let ae = rd_u8(&mut p)?;
                let wire_plen = rd_u8(&mut p)?;
                if ae == AE_WILDCARD {
                    Tlv::RouteRequest {
                        prefix: None,
                        src_prefix: UNSPEC,
                        src_plen: 0,
                        tos: Tos::DEFAULT,
                    }
                } else {
                    let empty = PrefixContext::default();
                    let (prefix, plen) = decode_prefix(ae, wire_plen, 0, &mut p, &empty)?;
                    let subs = parse_subtlvs(ae, &payload[p.position() as usize..])?;
                    let (src_prefix, src_plen) = subs
                        .src_prefix
                        .unwrap_or((if ae == AE_IPV4 { V4_UNSPEC } else { UNSPEC }, 0));
                    Tlv::RouteRequest {
                        prefix: Some((prefix, plen)),
                        src_prefix,
                        src_plen,
                        tos: subs.tos.unwrap_or(Tos::DEFAULT),
                    }
                }
            }
            10 => {
                let ae = rd_u8(&mut p)?;
                let wire_plen = rd_u8(&mut p)?;
                let seqno = rd_u16(&mut p)?;
                let hop_count = rd_u8(&mut p)?;
                rd_u8(&mut p)?; // reserved
                let bytes = rd_bytes(&mut p, 8)?;
                let mut router_id = [0u8; 8];
                router_id.copy_from_slice(&bytes);
                let empty = PrefixContext::default();
                let (prefix, plen) = decode_prefix(ae, wire_plen, 0, &mut p, &empty)?;
                let subs = parse_subtlvs(ae, &payload[p.position() as usize..])?;
                let (src_prefix, src_plen) = subs
                    .src_prefix
                    .unwrap_or((if ae == AE_IPV4 { V4_UNSPEC } else { UNSPEC }, 0));
                Tlv::SeqnoRequest {
                    seqno,
                    hop_count,
                    router_id,
                    prefix,
                    plen,
                    src_prefix,
                    src_plen,
                    tos: subs.tos.unwrap_or(Tos::DEFAULT),
                }
            }
            other => Tlv::Unknown {
                tlv_type: other,
                data: payload.to_vec(),
            },
        };
        Ok(tlv)
    }

    /// Encode this TLV into wire-format bytes. Prefixes are written
    /// uncompressed (`omitted = 0`).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Tlv::Pad1 => buf.push(0),
            Tlv::PadN { n } => {
                buf.push(1);
                buf.push(*n);
                buf.extend(std::iter::repeat(0).take(*n as usize));
            }
            Tlv::AckRequest { opaque, interval } => {
                buf.push(2);
                buf.push(6);
                buf.extend(&[0, 0]);
                buf.write_u16::<BigEndian>(*opaque).expect("vec write");
                buf.write_u16::<BigEndian>(*interval).expect("vec write");
            }
            Tlv::Ack { opaque } => {
                buf.push(3);
                buf.push(2);
                buf.write_u16::<BigEndian>(*opaque).expect("vec write");
            }
            Tlv::Hello {
                flags,
                seqno,
                interval,
            } => {
                buf.push(4);
                buf.push(6);
                buf.write_u16::<BigEndian>(*flags).expect("vec write");
                buf.write_u16::<BigEndian>(*seqno).expect("vec write");
                buf.write_u16::<BigEndian>(*interval).expect("vec write");
            }
            Tlv::Ihu {
                rxcost,
                interval,
                address,
            } => {
                buf.push(5);
                let (ae, addr_bytes) = match address {
                    None => (AE_WILDCARD, Vec::new()),
                    Some(addr) if is_v4_mapped(addr) => (AE_IPV4, addr.octets()[12..].to_vec()),
                    Some(addr) => (AE_IPV6, addr.octets().to_vec()),
                };
                buf.push((6 + addr_bytes.len()) as u8);
                buf.push(ae);
                buf.push(0);
                buf.write_u16::<BigEndian>(*rxcost).expect("vec write");
                buf.write_u16::<BigEndian>(*interval).expect("vec write");
                buf.extend(addr_bytes);
            }
            Tlv::RouterId { router_id } => {
                buf.push(6);
                buf.push(10);
                buf.extend(&[0, 0]);
                buf.extend(router_id);
            }
            Tlv::NextHop { address } => {
                buf.push(7);
                let (ae, addr_bytes) = if is_v4_mapped(address) {
                    (AE_IPV4, address.octets()[12..].to_vec())
                } else {
                    (AE_IPV6, address.octets().to_vec())
                };
                buf.push((2 + addr_bytes.len()) as u8);
                buf.push(ae);
                buf.push(0);
                buf.extend(addr_bytes);
            }
            Tlv::Update {
                flags,
                interval,
                seqno,
                metric,
                prefix,
                plen,
                src_prefix,
                src_plen,
                tos,
            } => {
                let ae = ae_of(prefix);
                let wire_plen = plen - ae_bias(ae);
                let prefix_bytes = (wire_plen as usize + 7) / 8;
                let base = if ae == AE_IPV4 { 12 } else { 0 };

                let mut body = Vec::new();
                body.push(ae);
                body.push(*flags);
                body.push(wire_plen);
                body.push(0); // omitted
                body.write_u16::<BigEndian>(*interval).expect("vec write");
                body.write_u16::<BigEndian>(*seqno).expect("vec write");
                body.write_u16::<BigEndian>(*metric).expect("vec write");
                body.extend_from_slice(&prefix.octets()[base..base + prefix_bytes]);
                encode_subtlvs(&mut body, ae, src_prefix, *src_plen, *tos);

                buf.push(8);
                buf.push(body.len() as u8);
                buf.extend(body);
            }
            Tlv::RouteRequest {
                prefix,
                src_prefix,
                src_plen,
                tos,
            } => {
                let mut body = Vec::new();
                match prefix {
                    None => {
                        body.push(AE_WILDCARD);
                        body.push(0);
                    }
                    Some((prefix, plen)) => {
                        let ae = ae_of(prefix);
                        let wire_plen = plen - ae_bias(ae);
                        let prefix_bytes = (wire_plen as usize + 7) / 8;
                        let base = if ae == AE_IPV4 { 12 } else { 0 };
                        body.push(ae);
                        body.push(wire_plen);
                        body.extend_from_slice(&prefix.octets()[base..base + prefix_bytes]);
                        encode_subtlvs(&mut body, ae, src_prefix, *src_plen, *tos);
                    }
                }
                buf.push(9);
                buf.push(body.len() as u8);
                buf.extend(body);
            }
            Tlv::SeqnoRequest {
                seqno,
                hop_count,
                router_id,
                prefix,
                plen,
                src_prefix,
                src_plen,
                tos,
            } => {
                let ae = ae_of(prefix);
                let wire_plen = plen - ae_bias(ae);
                let prefix_bytes = (wire_plen as usize + 7) / 8;
                let base = if ae == AE_IPV4 { 12 } else { 0 };

                let mut body = Vec::new();
                body.push(ae);
                body.push(wire_plen);
                body.write_u16::<BigEndian>(*seqno).expect("vec write");
                body.push(*hop_count);
                body.push(0);
                body.extend(router_id);
                body.extend_from_slice(&prefix.octets()[base..base + prefix_bytes]);
                encode_subtlvs(&mut body, ae, src_prefix, *src_plen, *tos);

                buf.push(10);
                buf.push(body.len() as u8);
                buf.extend(body);
            }
            Tlv::Unknown { tlv_type, data } => {
                buf.push(*tlv_type);
                buf.push(data.len() as u8);
                buf.extend(data);
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tos::DSCP_AF21;

    fn roundtrip(tlv: Tlv) -> Tlv {
        let bytes = tlv.to_bytes();
        let parsed = Tlv::parse_all(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        parsed.into_iter().next().unwrap()
    }

    #[test]
    fn pad_encoding() {
        assert_eq!(Tlv::Pad1.to_bytes(), vec![0]);
        assert_eq!(Tlv::PadN { n: 4 }.to_bytes(), vec![1, 4, 0, 0, 0, 0]);
        assert_eq!(roundtrip(Tlv::PadN { n: 3 }), Tlv::PadN { n: 3 });
    }

    #[test]
    fn hello_roundtrip() {
        let hello = Tlv::Hello {
            flags: HELLO_FLAG_UNICAST,
            seqno: 0x2030,
            interval: 400,
        };
        assert_eq!(roundtrip(hello.clone()), hello);
    }

    #[test]
    fn ihu_roundtrip_both_families() {
        let v6 = Tlv::Ihu {
            rxcost: 256,
            interval: 300,
            address: Some("fe80::42".parse().unwrap()),
        };
        assert_eq!(roundtrip(v6.clone()), v6);

        let v4 = Tlv::Ihu {
            rxcost: 96,
            interval: 300,
            address: Some("::ffff:192.0.2.1".parse().unwrap()),
        };
        assert_eq!(roundtrip(v4.clone()), v4);
    }

    #[test]
    fn update_roundtrip_preserves_qualifiers() {
        let update = Tlv::Update {
            flags: 0,
            interval: 400,
            seqno: 42,
            metric: 256,
            prefix: "2001:db8:1::".parse().unwrap(),
            plen: 64,
            src_prefix: "2001:db8:f::".parse().unwrap(),
            src_plen: 48,
            tos: Tos(DSCP_AF21),
        };
        assert_eq!(roundtrip(update.clone()), update);
    }

    #[test]
    fn update_roundtrip_v4_mapped() {
        let update = Tlv::Update {
            flags: 0,
            interval: 400,
            seqno: 7,
            metric: 128,
            prefix: "::ffff:192.0.2.0".parse().unwrap(),
            plen: 120, // a v4 /24
            src_prefix: "::ffff:0:0".parse().unwrap(),
            src_plen: 0,
            tos: Tos::DEFAULT,
        };
        let rt = roundtrip(update.clone());
        assert_eq!(rt, update);
    }

    #[test]
    fn omitted_prefix_uses_preceding_update() {
        let first = Tlv::Update {
            flags: 0,
            interval: 400,
            seqno: 1,
            metric: 100,
            prefix: "2001:db8:aa::".parse().unwrap(),
            plen: 48,
            src_prefix: Ipv6Addr::UNSPECIFIED,
            src_plen: 0,
            tos: Tos::DEFAULT,
        };
        // Hand-build a second update omitting the first 4 bytes.
        let mut second = vec![8, 12, AE_IPV6, 0, 48, 4, 1, 144, 0, 2, 0, 100];
        second.extend_from_slice(&[0x00, 0xbb]); // bytes 4..6 of the prefix
        let mut packet = first.to_bytes();
        packet.extend(second);

        let tlvs = Tlv::parse_all(&packet).unwrap();
        assert_eq!(tlvs.len(), 2);
        match &tlvs[1] {
            Tlv::Update { prefix, plen, .. } => {
                assert_eq!(*plen, 48);
                assert_eq!(prefix.to_string(), "2001:db8:bb::");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn omitted_without_context_is_an_error() {
        let orphan = vec![8, 12, AE_IPV6, 0, 48, 4, 1, 144, 0, 2, 0, 100, 0x00, 0xbb];
        assert_eq!(Tlv::parse_all(&orphan), Err(TlvError::NoDefaultPrefix));
    }

    #[test]
    fn seqno_request_roundtrip() {
        let req = Tlv::SeqnoRequest {
            seqno: 6,
            hop_count: 64,
            router_id: [0xAA, 0xBB, 0xCC, 0xDD, 1, 2, 3, 4],
            prefix: "2001:db8::".parse().unwrap(),
            plen: 64,
            src_prefix: "2001:db8:f::".parse().unwrap(),
            src_plen: 48,
            tos: Tos(DSCP_AF21),
        };
        assert_eq!(roundtrip(req.clone()), req);
    }

    #[test]
    fn route_request_wildcard_roundtrip() {
        let req = Tlv::RouteRequest {
            prefix: None,
            src_prefix: Ipv6Addr::UNSPECIFIED,
            src_plen: 0,
            tos: Tos::DEFAULT,
        };
        assert_eq!(roundtrip(req.clone()), req);
    }

    #[test]
    fn unknown_mandatory_subtlv_degrades_tlv() {
        let update = Tlv::Update {
            flags: 0,
            interval: 400,
            seqno: 1,
            metric: 100,
            prefix: "2001:db8::".parse().unwrap(),
            plen: 64,
            src_prefix: Ipv6Addr::UNSPECIFIED,
            src_plen: 0,
            tos: Tos::DEFAULT,
        };
        let mut bytes = update.to_bytes();
        // Append an unknown mandatory sub-TLV (type 200, length 1).
        bytes.extend_from_slice(&[200, 1, 0]);
        bytes[1] += 3; // fix outer length

        let tlvs = Tlv::parse_all(&bytes).unwrap();
        assert!(matches!(tlvs[0], Tlv::Unknown { tlv_type: 8, .. }));
    }

    #[test]
    fn unknown_tlv_roundtrip() {
        let tlv = Tlv::Unknown {
            tlv_type: 250,
            data: vec![1, 2, 3, 4],
        };
        assert_eq!(roundtrip(tlv.clone()), tlv);
    }

    #[test]
    fn truncated_body_is_rejected() {
        // Hello claiming 6 bytes of body with only 2 present.
        let bytes = vec![4, 6, 0, 0];
        assert_eq!(Tlv::parse_all(&bytes), Err(TlvError::Overrun));
    }

    #[test]
    fn parse_all_handles_multiple_tlvs() {
        let mut buf = Vec::new();
        buf.extend(Tlv::Pad1.to_bytes());
        buf.extend(Tlv::Ack { opaque: 42 }.to_bytes());
        buf.extend(
            Tlv::Hello {
                flags: 0,
                seqno: 1,
                interval: 400,
            }
            .to_bytes(),
        );
        let tlvs = Tlv::parse_all(&buf).unwrap();
        assert_eq!(tlvs.len(), 3);
        assert_eq!(tlvs[1], Tlv::Ack { opaque: 42 });
    }
}
