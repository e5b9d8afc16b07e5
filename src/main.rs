// qbabeld: a small Babel routing daemon speaking the source-specific,
// TOS-qualified dialect.
//
// Usage: qbabeld [ifname] [ifindex]
//
// It binds the Babel multicast group on the given interface, tracks
// neighbors and routes, and logs table events. Kernel route
// installation is stubbed out (NullFib); wire a real FIB adapter for
// production use.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use qbabel::event::{Destination, OutboundEvent};
use qbabel::fib::NullFib;
use qbabel::neighbor::NeighborKey;
use qbabel::node::{derive_router_id, BabelNode};
use qbabel::packet::{self, decode_events, encode_outbound, Packet, SendBuffer};
use qbabel::Config;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let ifname = args.next().unwrap_or_else(|| "eth0".to_string());
    let ifindex: u32 = args
        .next()
        .map(|s| s.parse().context("ifindex must be a number"))
        .transpose()?
        .unwrap_or(2);

    let mut config = Config::default();
    config.router_id = Some(derive_router_id(&ifname));
    config.validate().context("invalid configuration")?;

    let mut node = BabelNode::new(config, Box::new(NullFib));
    node.enable_interface(&ifname, ifindex);
    info!(%ifname, ifindex, "qbabeld started");

    let socket = packet::bind_multicast_v6(ifindex).context("binding babel socket")?;
    socket.set_nonblocking(true)?;

    let epoch = Instant::now();
    let mut buf = [0u8; 4096];
    let mut buffers: HashMap<Destination, SendBuffer> = HashMap::new();

    loop {
        let now = epoch.elapsed().as_millis() as u64;

        // Drain the socket.
        loop {
            match socket.recv_from(&mut buf) {
                Ok((amt, SocketAddr::V6(src))) => {
                    let from = NeighborKey {
                        ifindex,
                        address: *src.ip(),
                    };
                    match Packet::from_bytes(&buf[..amt]) {
                        Ok(pkt) => {
                            let decoded = decode_events(pkt.tlvs().to_vec());
                            if decoded.violations > 0
                                && node.note_protocol_violation(from, now)
                            {
                                debug!(%src, "rate-limiting misbehaving neighbour");
                                continue;
                            }
                            node.handle_packet(from, decoded.events, now);
                        }
                        Err(err) => {
                            debug!(%src, %err, "dropping malformed packet");
                            node.note_protocol_violation(from, now);
                        }
                    }
                }
                Ok((_, src)) => debug!(%src, "ignoring non-v6 packet"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(%e, "recv error");
                    break;
                }
            }
        }

        let wakeup = node.periodic(now);

        // Batch outbound TLVs per destination; a buffer goes out when
        // full or when its flush interval lapses.
        for ev in node.drain_outbound() {
            let dest = destination_of(&ev);
            let buffer = buffers
                .entry(dest)
                .or_insert_with(|| SendBuffer::new(1400, 40));
            for tlv in encode_outbound(&ev) {
                if buffer.push(tlv) {
                    if let Some(bytes) = buffer.flush(now) {
                        send(&socket, &bytes, dest);
                    }
                }
            }
        }
        for (dest, buffer) in buffers.iter_mut() {
            if buffer.due(now) {
                if let Some(bytes) = buffer.flush(now) {
                    send(&socket, &bytes, *dest);
                }
            }
        }

        for event in node.drain_local_events() {
            info!(?event, "table event");
        }

        std::thread::sleep(Duration::from_millis(wakeup.min(500)));
    }
}

fn destination_of(ev: &OutboundEvent) -> Destination {
    match ev {
        OutboundEvent::Update { dest, .. }
        | OutboundEvent::SeqnoRequest { dest, .. }
        | OutboundEvent::Ihu { dest, .. }
        | OutboundEvent::Hello { dest, .. } => *dest,
    }
}

fn send(socket: &std::net::UdpSocket, bytes: &[u8], dest: Destination) {
    let target = match dest {
        Destination::Multicast { ifindex } => {
            SocketAddrV6::new(packet::MULTICAST_V6_ADDR, packet::BABEL_PORT, 0, ifindex)
        }
        Destination::Unicast { ifindex, addr } => {
            SocketAddrV6::new(addr, packet::BABEL_PORT, 0, ifindex)
        }
    };
    if let Err(err) = socket.send_to(bytes, target) {
        // Dropped; the next scheduled emission covers it.
        debug!(%err, %target, "send failed");
    }
}
