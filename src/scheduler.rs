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

//! The local scheduler surface the dispatcher drives: lookup of a local
//! coroutine by id, a named channel by name, coro spawn from an RCI
//! method, `monitor`, `throw`, and `send`/`deliver` on channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::location::Location;
use crate::protocol::{HandleKind, KwValue, RemoteHandle};

/// What a registered RCI method actually is: the Rust rendering of "must be
/// a resumable generator function" — "the registered entry
/// implements the Task trait").
#[async_trait]
pub trait RciHandler: Send + Sync {
    async fn call(
        &self,
        args: Vec<KwValue>,
        kwargs: HashMap<String, KwValue>,
    ) -> Result<KwValue, String>;
}

/// A message destined for a coro or channel, local or remote. Local
/// delivery happens in-process; remote delivery is handed off to whoever
/// owns the peer table (the `Instance`) via `Scheduler::drain_relays`.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub target: RemoteHandle,
    pub message: KwValue,
}

/// Handle to a locally-running coroutine (here: an async task with an
/// inbox). `send` is a fire-and-forget push, returning `0` on success and
/// `-1` if the coro has exited.
pub struct LocalCoro {
    id: u64,
    location: Location,
    inbox: mpsc::UnboundedSender<KwValue>,
    exceptions: mpsc::UnboundedSender<(String, String)>,
    monitors: Mutex<Vec<RemoteHandle>>,
}

impl LocalCoro {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> RemoteHandle {
        RemoteHandle {
            kind: HandleKind::Coro,
            id_or_name: self.id.to_string(),
            location: self.location,
        }
    }

    pub fn send(&self, message: KwValue) -> i32 {
        if self.inbox.send(message).is_ok() {
            0
        } else {
            -1
        }
    }

    pub fn throw(&self, exc_type: String, exc_message: String) -> i32 {
        if self.exceptions.send((exc_type, exc_message)).is_ok() {
            0
        } else {
            -1
        }
    }

    pub fn add_monitor(&self, monitor: RemoteHandle) {
        self.monitors.lock().push(monitor);
    }
}

/// Handle to a locally-registered named channel.
pub struct LocalChannel {
    name: String,
    location: Location,
    subscribers: Mutex<Vec<RemoteHandle>>,
    local_subscribers: Mutex<Vec<Arc<LocalCoro>>>,
    relay_tx: mpsc::UnboundedSender<RelayMessage>,
}

impl LocalChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> RemoteHandle {
        RemoteHandle {
            kind: HandleKind::Channel,
            id_or_name: self.name.clone(),
            location: self.location,
        }
    }

    /// Fire-and-forget enqueue to every subscriber; returns the number
    /// successfully notified, mirroring `channel.send`.
    pub fn send(&self, message: KwValue) -> i32 {
        let mut n = 0;
        for coro in self.local_subscribers.lock().iter() {
            if coro.send(message.clone()) == 0 {
                n += 1;
            }
        }
        for sub in self.subscribers.lock().iter() {
            if self
                .relay_tx
                .send(RelayMessage {
                    target: sub.clone(),
                    message: message.clone(),
                })
                .is_ok()
            {
                n += 1;
            }
        }
        n
    }

    /// Awaited delivery bounded by `timeout` and fan-out limit `n`: the
    /// local rendering of `channel.deliver(msg, timeout=req.timeout, n=...)`.
    pub async fn deliver(&self, message: KwValue, bound: Option<Duration>, n: Option<usize>) -> i32 {
        let work = async {
            let limit = n.unwrap_or(usize::MAX);
            let mut delivered = 0;
            for coro in self.local_subscribers.lock().clone() {
                if delivered >= limit {
                    break;
                }
                if coro.send(message.clone()) == 0 {
                    delivered += 1;
                }
            }
            for sub in self.subscribers.lock().clone() {
                if delivered >= limit {
                    break;
                }
                if self
                    .relay_tx
                    .send(RelayMessage {
                        target: sub,
                        message: message.clone(),
                    })
                    .is_ok()
                {
                    delivered += 1;
                }
            }
            delivered as i32
        };

        match bound {
            Some(d) => timeout(d, work).await.unwrap_or(-1),
            None => work.await,
        }
    }

    pub fn subscribe(&self, subscriber: RemoteHandle) -> i32 {
        if subscriber.location == self.location {
            // Rebind remote handle referencing a local coro to the local
            // object instead of keeping it opaque is the
            // registry's job; here we just dedupe by identity.
        }
        if self
            .subscribers
            .lock()
            .iter()
            .any(|s| *s == subscriber)
        {
            return -1;
        }
        self.subscribers.lock().push(subscriber);
        0
    }

    pub fn unsubscribe(&self, subscriber: &RemoteHandle) -> i32 {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s != subscriber);
        if subs.len() < before {
            0
        } else {
            -1
        }
    }

    pub fn subscribe_local(&self, coro: Arc<LocalCoro>) -> i32 {
        self.local_subscribers.lock().push(coro);
        0
    }
}

/// Owns every locally-spawned coro and provides the monitor/throw/spawn
/// surface the dispatcher drives.
pub struct Scheduler {
    location: Location,
    next_id: AtomicU64,
    coros: DashMap<u64, Arc<LocalCoro>>,
    relay_tx: mpsc::UnboundedSender<RelayMessage>,
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayMessage>>>,
}

impl Scheduler {
    pub fn new(location: Location) -> Self {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        Self {
            location,
            next_id: AtomicU64::new(1),
            coros: DashMap::new(),
            relay_tx,
            relay_rx: Mutex::new(Some(relay_rx)),
        }
    }

    pub fn relay_sender(&self) -> mpsc::UnboundedSender<RelayMessage> {
        self.relay_tx.clone()
    }

    /// Taken once by the `Instance` at startup to forward channel/monitor
    /// relay traffic onto the peer table.
    pub fn take_relay_receiver(&self) -> Option<mpsc::UnboundedReceiver<RelayMessage>> {
        self.relay_rx.lock().take()
    }

    pub fn new_channel(&self, name: impl Into<String>) -> LocalChannel {
        LocalChannel {
            name: name.into(),
            location: self.location,
            subscribers: Mutex::new(Vec::new()),
            local_subscribers: Mutex::new(Vec::new()),
            relay_tx: self.relay_tx.clone(),
        }
    }

    pub fn coro(&self, id: u64) -> Option<Arc<LocalCoro>> {
        self.coros.get(&id).map(|e| e.value().clone())
    }

    /// Spawns a new coroutine running `handler.call(args, kwargs)`,
    /// mirroring `Coro(rci._method, *args, **kwargs)`. On completion, any
    /// installed monitors receive the exit status via `send`.
    pub fn spawn_coro(
        self: &Arc<Self>,
        handler: Arc<dyn RciHandler>,
        args: Vec<KwValue>,
        kwargs: HashMap<String, KwValue>,
    ) -> Arc<LocalCoro> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbox_tx, _inbox_rx) = mpsc::unbounded_channel();
        let (exc_tx, mut exc_rx) = mpsc::unbounded_channel();

        let coro = Arc::new(LocalCoro {
            id,
            location: self.location,
            inbox: inbox_tx,
            exceptions: exc_tx,
            monitors: Mutex::new(Vec::new()),
        });
        self.coros.insert(id, coro.clone());

        let scheduler = self.clone();
        let coro_for_task = coro.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                r = handler.call(args, kwargs) => r,
                Some((exc_type, exc_message)) = exc_rx.recv() => Err(format!("{}: {}", exc_type, exc_message)),
            };

            let status = match result {
                Ok(value) => value,
                Err(message) => KwValue::Text(message),
            };

            for monitor in coro_for_task.monitors.lock().iter() {
                if monitor.location == scheduler.location {
                    if let Some(target) = scheduler.coro(
                        monitor
                            .id_or_name
                            .parse()
                            .unwrap_or_default(),
                    ) {
                        target.send(status.clone());
                    }
                } else {
                    let _ = scheduler.relay_tx.send(RelayMessage {
                        target: monitor.clone(),
                        message: status.clone(),
                    });
                }
            }

            scheduler.coros.remove(&coro_for_task.id);
        });

        coro
    }

    /// `_monitor`: install a monitoring relation so the monitor receives
    /// exit/exception events for `coro`.
    pub fn install_monitor(&self, coro_id: u64, monitor: RemoteHandle) -> i32 {
        match self.coro(coro_id) {
            Some(coro) => {
                coro.add_monitor(monitor);
                0
            }
            None => -1,
        }
    }

    /// `_throw`: inject an exception tuple into a running coro.
    pub fn throw(&self, coro_id: u64, exc_type: String, exc_message: String) -> i32 {
        match self.coro(coro_id) {
            Some(coro) => coro.throw(exc_type, exc_message),
            None => -1,
        }
    }
}
