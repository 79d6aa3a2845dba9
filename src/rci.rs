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

//! Remote Callable Interface façade: register/unregister/locate/invoke,
//! mirroring the source's `RCI(method, name?)`. A registered entry is
//! anything implementing `RciHandler` (the Rust rendering of "must be a
//! resumable generator function" — see `scheduler::RciHandler`; the type
//! system makes the `isgeneratorfunction` check unnecessary).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::Context;
use crate::error::NetResult;
use crate::location::Location;
use crate::peer_table::PeerTable;
use crate::protocol::{KwValue, Kwargs, NetRequest, RemoteHandle, Reply, Verb};
use crate::registry::Registry;
use crate::reply;
use crate::scheduler::{RciHandler, Scheduler};
use crate::transport::TlsMaterial;

/// The source hardcodes a 2s timeout on `run_rci` invocation; kept as a
/// named constant rather than threaded through every call site.
pub const INVOKE_TIMEOUT: Duration = Duration::from_secs(2);

/// `RCI.register`: fails with `AlreadyRegistered`/`NotOwner` exactly as
/// `Registry::register_rci`.
pub fn register(registry: &Registry, name: &str, handler: Arc<dyn RciHandler>) -> NetResult<()> {
    registry.register_rci(name, handler)
}

pub fn unregister(registry: &Registry, name: &str) -> NetResult<()> {
    registry.unregister_rci(name)
}

/// `RCI.locate(name, location?, timeout?)`: a direct sync `locate_rci` to
/// `location` if given, else an async broadcast across every known peer
/// that completes on the first positive reply or `timeout`.
pub async fn locate(
    own_location: Location,
    registry: &Registry,
    peer_table: &PeerTable,
    tls: Option<&TlsMaterial>,
    name: &str,
    location: Option<Location>,
    timeout: Option<Duration>,
) -> Option<RemoteHandle> {
    let kwargs = Kwargs::LocateByName {
        name: name.to_string(),
    };
    if let Some(loc) = location {
        let req = NetRequest::new(Verb::LocateRci, kwargs)
            .with_dst(loc)
            .with_timeout(timeout);
        match reply::sync_reply(peer_table, req).await {
            Some(Reply::Handle(h)) => Some(h),
            _ => None,
        }
    } else {
        match reply::locate_broadcast(
            own_location,
            registry,
            peer_table,
            tls,
            Verb::LocateRci,
            kwargs,
            timeout,
        )
        .await
        {
            Some(Reply::Handle(h)) => Some(h),
            _ => None,
        }
    }
}

/// `rci(*args, **kwargs)`: wraps `run_rci` in a 2s sync call and returns
/// the new remote `Coro` handle, `None`, or the remote error re-raised as
/// `Err`. A handle pointing at this instance is served without a network
/// round trip, sharing the same not-found behaviour the dispatcher uses
/// for an inbound `run_rci`.
pub async fn invoke(
    own_location: Location,
    registry: &Registry,
    scheduler: &Arc<Scheduler>,
    peer_table: &PeerTable,
    handle: &RemoteHandle,
    args: Vec<KwValue>,
    kwargs: HashMap<String, KwValue>,
) -> Result<Option<RemoteHandle>, String> {
    if handle.location == own_location {
        return match registry.rci_handler(&handle.id_or_name) {
            Some(handler) => Ok(Some(scheduler.spawn_coro(handler, args, kwargs).handle())),
            None => Err(format!("no such rci \"{}\"", handle.id_or_name)),
        };
    }

    let req = NetRequest::new(
        Verb::RunRci,
        Kwargs::RunRci {
            name: handle.id_or_name.clone(),
            args,
            kwargs,
        },
    )
    .with_dst(handle.location)
    .with_timeout(Some(INVOKE_TIMEOUT));

    match reply::sync_reply(peer_table, req).await {
        Some(Reply::Handle(h)) => Ok(Some(h)),
        Some(Reply::Error(e)) => Err(e),
        Some(Reply::None) | None => Ok(None),
        Some(other) => Err(format!("unexpected reply to run_rci: {:?}", other)),
    }
}

/// Server side of `run_rci`, looked up by the dispatcher: spawns a new
/// local coro from the registered handler. An unknown name is captured as
/// an error payload and returned to the caller, who re-raises it (§7),
/// never propagated as a transport failure.
pub async fn handle_run_rci(
    ctx: &Context,
    name: &str,
    args: Vec<KwValue>,
    kwargs: HashMap<String, KwValue>,
) -> Reply {
    match ctx.registry.rci_handler(name) {
        Some(handler) => Reply::Handle(ctx.scheduler.spawn_coro(handler, args, kwargs).handle()),
        None => Reply::Error(format!("no such rci \"{}\"", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl RciHandler for Echo {
        async fn call(
            &self,
            args: Vec<KwValue>,
            _kwargs: HashMap<String, KwValue>,
        ) -> Result<KwValue, String> {
            Ok(args.into_iter().next().unwrap_or(KwValue::None))
        }
    }

    #[tokio::test]
    async fn invoking_an_unregistered_local_rci_returns_an_error() {
        let location = Location::new([127, 0, 0, 1].into(), 9000);
        let registry = Registry::new(std::iter::empty());
        let scheduler = Arc::new(Scheduler::new(location));
        let peer_table = Arc::new(PeerTable::new(None));
        let handle = RemoteHandle {
            kind: crate::protocol::HandleKind::Rci,
            id_or_name: "missing".into(),
            location,
        };

        let result = invoke(
            location,
            &registry,
            &scheduler,
            &peer_table,
            &handle,
            vec![],
            HashMap::new(),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invoking_a_registered_local_rci_spawns_a_coro() {
        let location = Location::new([127, 0, 0, 1].into(), 9000);
        let registry = Registry::new(std::iter::empty());
        register(&registry, "echo", Arc::new(Echo)).unwrap();
        let scheduler = Arc::new(Scheduler::new(location));
        let peer_table = Arc::new(PeerTable::new(None));
        let handle = RemoteHandle {
            kind: crate::protocol::HandleKind::Rci,
            id_or_name: "echo".into(),
            location,
        };

        let result = invoke(
            location,
            &registry,
            &scheduler,
            &peer_table,
            &handle,
            vec![KwValue::Int(1)],
            HashMap::new(),
        )
        .await
        .unwrap();

        assert!(result.is_some());
    }
}
