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

//! Process-wide (per-instance) tables: local coroutines by id, remote-
//! visible coroutines by name, remote-visible channels by name, RCIs by
//! name, pending outbound requests by id. Guarded by a single lock, since
//! user code may touch these tables from other OS threads in the host
//! program.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{NetError, NetResult};
use crate::protocol::{NetRequest, Reply};
use crate::scheduler::{LocalChannel, LocalCoro, RciHandler};

/// An outbound request awaiting an async reply, keyed by `id` in
/// `_requests`. Holds a deep-enough copy of the original request so it can
/// be re-sent (with a fresh `auth` stamp) to every peer discovered while it
/// is still outstanding.
pub struct PendingRequest {
    pub req: NetRequest,
    reply_tx: Option<oneshot::Sender<Option<Reply>>>,
}

pub struct RciEntry {
    pub handler: Arc<dyn RciHandler>,
}

#[derive(Default)]
struct Inner {
    rcoros: HashMap<String, Arc<LocalCoro>>,
    rchannels: HashMap<String, Arc<LocalChannel>>,
    rcis: HashMap<String, RciEntry>,
    requests: HashMap<u64, PendingRequest>,
    stream_peers: HashSet<(Ipv4Addr, u16)>,
}

pub struct Registry {
    inner: Mutex<Inner>,
    next_request_id: AtomicU64,
}

impl Registry {
    pub fn new(stream_peers: impl IntoIterator<Item = (Ipv4Addr, u16)>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                stream_peers: stream_peers.into_iter().collect(),
                ..Default::default()
            }),
            next_request_id: AtomicU64::new(1),
        }
    }

    // -- coros --------------------------------------------------------

    pub fn register_coro(&self, name: &str, coro: Arc<LocalCoro>) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if inner.rcoros.contains_key(name) {
            return Err(NetError::AlreadyRegistered(name.to_string()));
        }
        inner.rcoros.insert(name.to_string(), coro);
        Ok(())
    }

    pub fn unregister_coro(&self, name: &str) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if inner.rcoros.remove(name).is_some() {
            Ok(())
        } else {
            Err(NetError::NotOwner)
        }
    }

    pub fn coro_by_name(&self, name: &str) -> Option<Arc<LocalCoro>> {
        self.inner.lock().rcoros.get(name).cloned()
    }

    // -- channels -------------------------------------------------------

    pub fn register_channel(&self, name: &str, channel: Arc<LocalChannel>) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if inner.rchannels.contains_key(name) {
            return Err(NetError::AlreadyRegistered(name.to_string()));
        }
        inner.rchannels.insert(name.to_string(), channel);
        Ok(())
    }

    pub fn unregister_channel(&self, name: &str) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if inner.rchannels.remove(name).is_some() {
            Ok(())
        } else {
            Err(NetError::NotOwner)
        }
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Arc<LocalChannel>> {
        self.inner.lock().rchannels.get(name).cloned()
    }

    // -- rcis -------------------------------------------------------------

    pub fn register_rci(&self, name: &str, handler: Arc<dyn RciHandler>) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if inner.rcis.contains_key(name) {
            return Err(NetError::AlreadyRegistered(name.to_string()));
        }
        inner.rcis.insert(name.to_string(), RciEntry { handler });
        Ok(())
    }

    pub fn unregister_rci(&self, name: &str) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if inner.rcis.remove(name).is_some() {
            Ok(())
        } else {
            Err(NetError::NotOwner)
        }
    }

    pub fn rci_handler(&self, name: &str) -> Option<Arc<dyn RciHandler>> {
        self.inner.lock().rcis.get(name).map(|e| e.handler.clone())
    }

    // -- pending requests (async reply correlation) --------------------

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn install_pending(&self, req: NetRequest) -> (u64, oneshot::Receiver<Option<Reply>>) {
        let id = req.id.expect("pending request must carry an id");
        let (tx, rx) = oneshot::channel();
        self.inner.lock().requests.insert(
            id,
            PendingRequest {
                req,
                reply_tx: Some(tx),
            },
        );
        (id, rx)
    }

    /// Resolves a pending request with the reply that arrived on a fresh,
    /// peer-initiated connection; see dispatcher's async-reply recognition.
    pub fn resolve_pending(&self, id: u64, reply: Option<Reply>) {
        if let Some(mut pending) = self.inner.lock().requests.remove(&id) {
            if let Some(tx) = pending.reply_tx.take() {
                let _ = tx.send(reply);
            }
        }
    }

    pub fn remove_pending(&self, id: u64) {
        self.inner.lock().requests.remove(&id);
    }

    /// Snapshot of every pending request whose `dst` is unset or matches
    /// `only_for`, used to drain the broadcast queue to a newly discovered
    /// peer. Each entry is a deep clone of the original envelope, because
    /// the same logical request fans out to many peers with different
    /// `auth` stamps while the original pending entry must survive
    /// untouched to correlate the real reply.
    pub fn pending_snapshot_for(&self, only_for: crate::location::Location) -> Vec<(u64, NetRequest)> {
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|(_, p)| p.req.dst.is_none() || p.req.dst == Some(only_for))
            .map(|(id, p)| (*id, p.req.clone()))
            .collect()
    }

    // -- stream peers -----------------------------------------------------

    pub fn is_stream_peer(&self, addr: Ipv4Addr, port: u16) -> bool {
        let inner = self.inner.lock();
        inner.stream_peers.contains(&(addr, port)) || inner.stream_peers.contains(&(addr, 0))
    }
}
