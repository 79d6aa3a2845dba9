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

//! Per-peer request pipeline. One worker task per peer drains a FIFO queue
//! of outbound requests, reusing a single TCP connection when the peer is
//! configured to stream and tearing it down between requests otherwise.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::auth::AuthCode;
use crate::location::Location;
use crate::protocol::{NetRequest, Reply};
use crate::transport::{Transport, TlsMaterial};
use crate::wire;

struct QueuedRequest {
    req: NetRequest,
    reply_tx: oneshot::Sender<Option<Reply>>,
}

/// Handle a caller uses to enqueue requests to one peer; the worker itself
/// lives in the spawned task and is reachable only through `tx`.
pub struct PeerHandle {
    pub location: Location,
    pub auth: Option<AuthCode>,
    pub stream: bool,
    tx: mpsc::UnboundedSender<QueuedRequest>,
}

impl PeerHandle {
    /// Enqueues `req`, stamping nothing itself — the worker stamps `auth`
    /// right before sending, matching `req.auth = self.auth` in the
    /// source's `req_proc`.
    pub fn enqueue(&self, req: NetRequest) -> Result<oneshot::Receiver<Option<Reply>>, NetRequest> {
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.tx.send(QueuedRequest { req, reply_tx }) {
            Ok(()) => Ok(reply_rx),
            Err(send_err) => Err(send_err.0.req),
        }
    }
}

/// Process-wide (per-instance) map of known peers. Deliberately a field of
/// the instance rather than a global static so that two
/// instances sharing a process — as in tests — never share peer tables.
pub struct PeerTable {
    peers: DashMap<(Ipv4Addr, u16), Arc<PeerHandle>>,
    tls: Option<TlsMaterial>,
}

impl PeerTable {
    pub fn new(tls: Option<TlsMaterial>) -> Self {
        Self {
            peers: DashMap::new(),
            tls,
        }
    }

    pub fn get(&self, key: (Ipv4Addr, u16)) -> Option<Arc<PeerHandle>> {
        self.peers.get(&key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: (Ipv4Addr, u16)) -> bool {
        self.peers.contains_key(&key)
    }

    pub fn snapshot(&self) -> Vec<((Ipv4Addr, u16), Arc<PeerHandle>)> {
        self.peers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Installs a new peer and spawns its drain worker. Invariant: at most
    /// one `Peer` per `(addr, port)`.
    pub fn insert(&self, location: Location, auth: Option<AuthCode>, stream: bool) -> Arc<PeerHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle {
            location,
            auth,
            stream,
            tx,
        });
        self.peers.insert(location.key(), handle.clone());

        let tls = self.tls.clone();
        tokio::spawn(worker_loop(location, auth, stream, tls, rx));

        handle
    }

    /// Removes the peer and terminates its worker (dropping `tx` makes the
    /// worker's `rx.recv()` return `None`, ending the task and discarding
    /// any still-queued requests).
    pub fn remove(&self, location: Location) {
        self.peers.remove(&location.key());
    }

    /// `_Peer.send_req`: enqueue `req` to its `dst` peer. Returns `-1`
    /// (`UnknownPeer`) if no such peer is known.
    pub fn send_req(&self, req: NetRequest) -> Result<oneshot::Receiver<Option<Reply>>, crate::error::NetError> {
        let dst = req.dst.ok_or(crate::error::NetError::UnknownPeer("<no dst>".into()))?;
        let peer = self
            .get(dst.key())
            .ok_or_else(|| crate::error::NetError::UnknownPeer(dst.to_string()))?;
        peer.enqueue(req)
            .map_err(|_| crate::error::NetError::UnknownPeer(dst.to_string()))
    }
}

async fn worker_loop(
    location: Location,
    auth: Option<AuthCode>,
    stream: bool,
    tls: Option<TlsMaterial>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
) {
    let mut conn: Option<Transport> = None;

    // The FIFO queue itself *is* `rx`; popping the head and blocking when
    // empty is `rx.recv().await` — the mpsc channel collapses `reqs` and
    // `reqs_pending` into one primitive.
    while let Some(queued) = rx.recv().await {
        process_one(&mut conn, &location, auth, tls.as_ref(), queued).await;

        // Only idle (close) the connection once the queue is observed
        // empty, so a burst of requests to a non-streaming peer still
        // reuses one socket instead of reconnecting per request.
        if !stream && rx.is_empty() {
            conn = None;
        }
    }
}

async fn process_one(
    conn: &mut Option<Transport>,
    location: &Location,
    auth: Option<AuthCode>,
    tls: Option<&TlsMaterial>,
    mut queued: QueuedRequest,
) {
    if conn.is_none() {
        let addr = SocketAddr::V4(SocketAddrV4::new(location.addr, location.port));
        match Transport::connect(addr, tls).await {
            Ok(t) => *conn = Some(t),
            Err(e) => {
                debug!("could not connect to {}: {}", location, e);
                let _ = queued.reply_tx.send(None);
                return;
            }
        }
    }

    queued.req.auth = auth;
    match exchange(conn.as_mut().unwrap(), &queued.req).await {
        Ok(reply) => {
            let _ = queued.reply_tx.send(reply);
        }
        Err(e) => {
            debug!("could not send \"{:?}\" to {}: {}", queued.req.verb, location, e);
            *conn = None;
            let _ = queued.reply_tx.send(None);
        }
    }
}

async fn exchange(conn: &mut Transport, req: &NetRequest) -> crate::error::NetResult<Option<Reply>> {
    wire::send_msg(conn, req).await?;
    let reply_req = wire::recv_msg(conn).await?;
    Ok(reply_req.and_then(|r| r.reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Kwargs, Verb};
    use tokio::net::TcpListener;

    /// Property 2: requests enqueued to the same peer arrive at that peer
    /// in enqueue order. A mock peer accepts one connection and records the
    /// order in which `RunRci` names land, echoing a trivial status back so
    /// the worker keeps draining.
    #[tokio::test]
    async fn requests_to_one_peer_are_delivered_in_fifo_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = listener.local_addr().unwrap();
        let location = Location::new(
            match peer_addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            peer_addr.port(),
        );

        let mock = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Transport::Plain(stream);
            let mut seen = Vec::new();
            while let Some(req) = wire::recv_msg(&mut conn).await.unwrap() {
                if let Kwargs::RunRci { name, .. } = &req.kwargs {
                    seen.push(name.clone());
                }
                let mut resp = NetRequest::new(req.verb, Kwargs::None);
                resp.reply = Some(Reply::Status(0));
                wire::send_msg(&mut conn, &resp).await.unwrap();
            }
            seen
        });

        let table = PeerTable::new(None);
        table.insert(location, None, false);

        let mut receivers = Vec::new();
        for i in 0..20 {
            let req = NetRequest::new(
                Verb::RunRci,
                Kwargs::RunRci {
                    name: format!("call-{i}"),
                    args: vec![],
                    kwargs: Default::default(),
                },
            )
            .with_dst(location);
            receivers.push(table.send_req(req).unwrap());
        }
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Some(Reply::Status(0)));
        }

        table.remove(location);
        let seen = mock.await.unwrap();
        let expected: Vec<String> = (0..20).map(|i| format!("call-{i}")).collect();
        assert_eq!(seen, expected);
    }
}
