// asyncoro-net - distributed coroutine transport: peer discovery, request
// pipeline, and file transfer for a mesh of scheduler instances.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Peer discovery: a UDP broadcast announces this instance to the LAN, and
//! a two-step TCP ping/pong handshake turns that announcement into an entry
//! in `PeerTable`. Step ordering: validate version, compute auth, connect
//! back, exchange a counter request, read one ack/nak line, relay to
//! same-host peers, install, drain pending broadcasts.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use log::debug;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

use crate::auth::{AuthCode, AuthState};
use crate::location::Location;
use crate::peer_table::PeerTable;
use crate::protocol::{self, Kwargs, NetRequest, PingInfo, Verb, PROTOCOL_VERSION};
use crate::registry::Registry;
use crate::reply;
use crate::transport::{Transport, TlsMaterial};
use crate::wire;

/// Binds the UDP discovery socket with `SO_REUSEADDR`/`SO_BROADCAST` set via
/// `socket2` before handing it to tokio, mirroring the low-level sockopt
/// tuning the pack's `librad` does for its own gossip sockets.
pub fn bind_udp(udp_port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, udp_port).into();
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn own_ping_info(own_location: Location, auth: &AuthState) -> PingInfo {
    PingInfo {
        location: own_location,
        signature: auth.signature().cloned(),
        version: PROTOCOL_VERSION.to_string(),
    }
}

/// One-shot UDP announcement at startup. No reply is expected on this
/// socket; peers that hear it answer over a fresh TCP connection.
pub async fn broadcast_ping(socket: &UdpSocket, udp_port: u16, own_location: Location, auth: &AuthState) {
    let req = NetRequest::new(Verb::Ping, Kwargs::Ping(own_ping_info(own_location, auth)));
    let bytes = match protocol::serialize(&req) {
        Ok(b) => b,
        Err(e) => {
            debug!("could not encode discovery ping: {}", e);
            return;
        }
    };
    let dst = SocketAddrV4::new(Ipv4Addr::BROADCAST, udp_port);
    if let Err(e) = socket.send_to(&bytes, dst).await {
        debug!("udp broadcast to {} failed: {}", dst, e);
    }
}

/// Runs forever, handling one inbound UDP ping datagram per iteration
///. Intended to be `tokio::spawn`ed by the instance.
pub async fn run_udp_listener(
    socket: Arc<UdpSocket>,
    own_location: Location,
    auth: Arc<AuthState>,
    peer_table: Arc<PeerTable>,
    tls: Option<TlsMaterial>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        let len = match socket.recv_from(&mut buf).await {
            Ok((len, _from)) => len,
            Err(e) => {
                debug!("udp recv error: {}", e);
                continue;
            }
        };

        let req = match protocol::deserialize(&buf[..len]) {
            Ok(r) => r,
            Err(_) => {
                debug!("ignoring malformed discovery datagram");
                continue;
            }
        };
        let info = match (&req.verb, &req.kwargs) {
            (Verb::Ping, Kwargs::Ping(info)) => info.clone(),
            _ => {
                debug!("ignoring non-ping datagram on discovery socket");
                continue;
            }
        };

        // Step 1: version mismatch or loopback-to-self is a silent drop.
        if info.version != PROTOCOL_VERSION || info.location == own_location {
            continue;
        }

        // Step 2: already known with a matching auth code -> nothing to do.
        let remote_auth = info
            .signature
            .as_ref()
            .and_then(|sig| auth.remote_auth_code(sig));
        if peer_table
            .get(info.location.key())
            .map(|p| p.auth == remote_auth)
            .unwrap_or(false)
        {
            continue;
        }

        // Step 3: open a TCP connection to P and send our own ping. No
        // reply is awaited here — P answers (or doesn't) over its own
        // fresh connection, handled by `handle_tcp_ping` below.
        let mut out = NetRequest::new(Verb::Ping, Kwargs::Ping(own_ping_info(own_location, &auth)))
            .with_dst(info.location);
        out.auth = remote_auth;
        if let Err(e) = reply::send_oneshot(info.location, &out, tls.as_ref()).await {
            debug!("could not ping back {}: {}", info.location, e);
        }
    }
}

/// Relay-then-install-then-drain, shared by the `ping` and `pong` TCP
/// branches once a peer P has answered the handshake.
async fn complete_handshake(
    info: &PingInfo,
    peer_auth: Option<AuthCode>,
    peer_table: &PeerTable,
    registry: &Registry,
    tls: Option<&TlsMaterial>,
) {
    // Step 4: forward P's announcement to every other peer already known on
    // the same host, so they run their own handshake against P directly.
    for (key, existing) in peer_table.snapshot() {
        if key.0 == info.location.addr && key.1 != info.location.port {
            let sibling = Location::new(key.0, key.1);
            let mut relay = NetRequest::new(Verb::Ping, Kwargs::Ping(info.clone())).with_dst(sibling);
            relay.auth = existing.auth;
            if let Err(e) = reply::send_oneshot(sibling, &relay, tls).await {
                debug!("could not relay ping for {} to {}: {}", info.location, sibling, e);
            }
        }
    }

    // Step 5: re-check immediately before inserting to avoid double-adding
    // P under a race with a concurrent handshake reaching the same point.
    if peer_table.contains(info.location.key()) {
        return;
    }
    let stream = registry.is_stream_peer(info.location.addr, info.location.port);
    peer_table.insert(info.location, peer_auth, stream);

    // Step 6: drain every pending broadcast request addressed to P (or to
    // nobody in particular), preserving its id so the eventual reply still
    // correlates against the originating `_requests` entry.
    for (id, mut pending) in registry.pending_snapshot_for(info.location) {
        pending.dst = Some(info.location);
        pending.auth = peer_auth;
        pending.id = Some(id);
        if let Err(e) = reply::send_oneshot(info.location, &pending, tls).await {
            debug!("could not drain pending request {} to {}: {}", id, info.location, e);
        }
    }
}

/// Inbound TCP `ping`: the dispatcher hands this off whenever it reads a
/// `Verb::Ping` request off an accepted connection.
pub async fn handle_tcp_ping(
    own_location: Location,
    auth: &AuthState,
    info: PingInfo,
    peer_table: &PeerTable,
    registry: &Registry,
    tls: Option<&TlsMaterial>,
) {
    if info.version != PROTOCOL_VERSION || info.location == own_location {
        debug!("dropping ping from {} (version mismatch or self)", info.location);
        return;
    }
    let remote_auth = info
        .signature
        .as_ref()
        .and_then(|sig| auth.remote_auth_code(sig));
    if peer_table
        .get(info.location.key())
        .map(|p| p.auth == remote_auth)
        .unwrap_or(false)
    {
        return;
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(info.location.addr, info.location.port));
    let mut conn = match Transport::connect(addr, tls).await {
        Ok(c) => c,
        Err(e) => {
            debug!("could not connect back to {} for pong: {}", info.location, e);
            return;
        }
    };
    let mut pong = NetRequest::new(Verb::Pong, Kwargs::Pong(own_ping_info(own_location, auth)))
        .with_dst(info.location);
    pong.auth = remote_auth;
    if let Err(e) = wire::send_msg(&mut conn, &pong).await {
        debug!("could not send pong to {}: {}", info.location, e);
        return;
    }

    match wire::recv_bytes(&mut conn).await {
        Ok(Some(line)) if line == b"ack" => {
            complete_handshake(&info, remote_auth, peer_table, registry, tls).await;
        }
        Ok(_) => debug!("peer {} declined handshake (nak)", info.location),
        Err(e) => debug!("handshake read error from {}: {}", info.location, e),
    }
}

/// Inbound TCP `pong`: answered directly on the connection it arrived on
/// (the sender opened it purely to receive this ack/nak), then completes
/// the handshake exactly like `ping` does.
pub async fn handle_tcp_pong(
    own_location: Location,
    auth: &AuthState,
    info: PingInfo,
    conn: &mut Transport,
    peer_table: &PeerTable,
    registry: &Registry,
    tls: Option<&TlsMaterial>,
) {
    if info.version != PROTOCOL_VERSION || info.location == own_location {
        let _ = wire::send_bytes(conn, b"nak").await;
        return;
    }
    let remote_auth = info
        .signature
        .as_ref()
        .and_then(|sig| auth.remote_auth_code(sig));
    if peer_table.contains(info.location.key()) {
        let _ = wire::send_bytes(conn, b"nak").await;
        return;
    }
    if wire::send_bytes(conn, b"ack").await.is_err() {
        return;
    }
    complete_handshake(&info, remote_auth, peer_table, registry, tls).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_info_carries_own_signature() {
        let auth = AuthState::new(Some("shared".into()));
        let location = Location::new([10, 0, 0, 1].into(), 9000);
        let info = own_ping_info(location, &auth);
        assert_eq!(info.location, location);
        assert_eq!(info.signature.as_ref(), auth.signature());
        assert_eq!(info.version, PROTOCOL_VERSION);
    }
}
