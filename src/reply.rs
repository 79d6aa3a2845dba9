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

//! Sync/async reply glue. Two reply disciplines share the same wire
//! format: a sync reply travels back on the same TCP connection as the
//! request; an async reply is delivered later, over a connection the
//! receiver opens back to `src`, correlated by `id`.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::error::NetResult;
use crate::location::Location;
use crate::peer_table::PeerTable;
use crate::protocol::{Kwargs, NetRequest, Reply, Verb};
use crate::registry::Registry;
use crate::transport::{Transport, TlsMaterial};
use crate::wire;

/// `_sync_reply`: enqueue `req` (which must have `src == None`) to its
/// peer and wait for the reply on the same connection, bounded by
/// `req.timeout`. Returns `None` on timeout or transport failure — callers
/// map that to whatever sentinel (`-1`, `null`) the verb uses.
pub async fn sync_reply(peer_table: &PeerTable, req: NetRequest) -> Option<Reply> {
    debug_assert!(req.src.is_none());
    let timeout = req.timeout;
    let rx = match peer_table.send_req(req) {
        Ok(rx) => rx,
        Err(_) => return None,
    };

    match timeout {
        Some(d) => tokio::time::timeout(d, rx)
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten(),
        None => rx.await.ok().flatten(),
    }
}

/// Opens a fresh, ad hoc connection to `dst` and sends `req`, without
/// waiting for (or expecting) a same-connection reply. This is how the
/// source fires `locate_*` broadcasts, handshake relays, and peer-
/// initiated async replies: none of those go through the per-peer FIFO
/// worker, because each is a one-off connection outside the normal
/// request pipeline.
pub async fn send_oneshot(
    dst: Location,
    req: &NetRequest,
    tls: Option<&TlsMaterial>,
) -> NetResult<()> {
    let addr = SocketAddr::V4(SocketAddrV4::new(dst.addr, dst.port));
    let mut conn = Transport::connect(addr, tls).await?;
    wire::send_msg(&mut conn, req).await
}

/// `RCI.locate`/`AsynCoro.locate`'s no-specific-peer path: install a
/// pending entry keyed by a fresh id, fire an async `locate_*` at every
/// currently known peer, and wait for the first positive reply or
/// `timeout`. If no peer answers, `_requests` is empty again once this
/// returns (testable property 3).
pub async fn locate_broadcast(
    own_location: Location,
    registry: &Registry,
    peer_table: &PeerTable,
    tls: Option<&TlsMaterial>,
    verb: Verb,
    kwargs: Kwargs,
    timeout: Option<Duration>,
) -> Option<Reply> {
    let id = registry.next_request_id();
    let template = NetRequest::new(verb, kwargs)
        .with_src(own_location)
        .with_id(id);
    let (_, rx) = registry.install_pending(template.clone());

    for (_, peer) in peer_table.snapshot() {
        let mut req = template.clone();
        req.dst = Some(peer.location);
        req.auth = peer.auth;
        if send_oneshot(peer.location, &req, tls).await.is_err() {
            log::debug!("could not send {:?} to {}", req.verb, peer.location);
        }
    }

    let reply = match timeout {
        Some(d) => tokio::time::timeout(d, rx).await.ok().and_then(|r| r.ok()).flatten(),
        None => rx.await.ok().flatten(),
    };
    registry.remove_pending(id);
    reply
}

/// Sends `req` (a sync verb whose `src` was set by the receiver, marking it
/// as an async return) back to `dst` with `reply` filled in. Used by the
/// dispatcher after processing a `locate_*`/`locate_peer` request that
/// arrived with `src` set.
pub async fn send_async_return(
    dst: Location,
    mut req: NetRequest,
    reply: Reply,
    auth: Option<crate::auth::AuthCode>,
    tls: Option<&TlsMaterial>,
) -> NetResult<()> {
    req.reply = Some(reply);
    req.auth = auth;
    send_oneshot(dst, &req, tls).await
}
