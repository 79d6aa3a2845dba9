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

//! Inbound TCP request handling. One task per accepted connection, looping
//! a plain read over the framed `NetRequest` envelope — outbound traffic
//! always goes through `peer_table`, never through an inbound accepted
//! socket, so this loop has no outbound side-channel to select against.

use std::sync::Arc;

use log::debug;

use crate::auth::AuthState;
use crate::discovery;
use crate::file_transfer;
use crate::location::Location;
use crate::protocol::{HandleKind, KwValue, Kwargs, NetRequest, RemoteHandle, Reply, Verb};
use crate::registry::Registry;
use crate::rci;
use crate::scheduler::Scheduler;
use crate::transport::{Transport, TlsMaterial};
use crate::wire;

/// Everything a connection task needs, bundled so `Instance` can hand over
/// one cheap `Clone` per accepted socket.
#[derive(Clone)]
pub struct Context {
    pub own_location: Location,
    pub auth: Arc<AuthState>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub peer_table: Arc<crate::peer_table::PeerTable>,
    pub tls: Option<TlsMaterial>,
    pub dest_path_prefix: Arc<str>,
    pub max_file_size: Option<u64>,
    /// The instance's own configured `General::name`, used only by
    /// `locate_peer`'s name match.
    pub configured_name: Option<String>,
}

/// Drives one accepted connection until it closes or `terminate` is
/// received. Spawned by the instance's accept loop.
pub async fn handle_connection(mut conn: Transport, ctx: Context) {
    loop {
        let req = match wire::recv_msg(&mut conn).await {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                debug!("connection read error: {}", e);
                return;
            }
        };

        if !req.verb.bypasses_auth() && !ctx.auth.accepts(req.auth) {
            debug!("dropping {:?}: auth mismatch", req.verb);
            return;
        }
        if let Some(dst) = req.dst {
            if dst != ctx.own_location {
                debug!("dropping {:?}: dst {} is not us", req.verb, dst);
                return;
            }
        }

        // Inbound async reply: a peer we sent a `locate_*`/async request to
        // is returning the answer over a fresh connection it opened back to
        // us.
        if req.src == Some(ctx.own_location) {
            if let Some(id) = req.id {
                ctx.registry.resolve_pending(id, req.reply);
            }
            return;
        }

        match req.verb {
            Verb::Ping => {
                if let Kwargs::Ping(info) = req.kwargs {
                    discovery::handle_tcp_ping(
                        ctx.own_location,
                        &ctx.auth,
                        info,
                        &ctx.peer_table,
                        &ctx.registry,
                        ctx.tls.as_ref(),
                    )
                    .await;
                }
                // A ping connection carries no further traffic; the
                // pong/ack dance happens on connections opened elsewhere.
                return;
            }
            Verb::Pong => {
                if let Kwargs::Pong(info) = req.kwargs {
                    discovery::handle_tcp_pong(
                        ctx.own_location,
                        &ctx.auth,
                        info,
                        &mut conn,
                        &ctx.peer_table,
                        &ctx.registry,
                        ctx.tls.as_ref(),
                    )
                    .await;
                }
                return;
            }
            Verb::Terminate => {
                if let Kwargs::Terminate { peer } = req.kwargs {
                    if let Some(peer) = peer {
                        ctx.peer_table.remove(peer);
                    }
                }
                let mut ack = NetRequest::new(Verb::Terminate, Kwargs::None);
                ack.reply = Some(Reply::Ack);
                let _ = wire::send_msg(&mut conn, &ack).await;
                return;
            }
            Verb::SendFile => {
                // The file body and its control codes travel as raw framed
                // lines directly on `conn`, not as further `NetRequest`
                // envelopes — `handle_send_file` owns the whole exchange.
                if file_transfer::handle_send_file(&mut conn, req.kwargs, &ctx).await.is_err() {
                    return;
                }
                continue;
            }
            Verb::DelFile => {
                let reply = file_transfer::handle_del_file(req.kwargs, &ctx).await;
                finish(&mut conn, req.verb, req.src, req.id, req.dst, Some(reply), &ctx).await;
                continue;
            }
            other => {
                let dst = req.dst;
                let src = req.src;
                let id = req.id;
                let reply = dispatch_sync_verb(other, req.kwargs, &ctx, src, dst).await;
                finish(&mut conn, other, src, id, dst, reply, &ctx).await;
                continue;
            }
        }
    }
}

/// Delivers a (possibly absent) reply: `None` means send nothing at all
/// (the `locate_*` broadcast quirk); `Some(reply)` travels back inline on
/// `conn` when `src` is unset, or via a fresh async-return connection to
/// `src` otherwise.
async fn finish(
    conn: &mut Transport,
    verb: Verb,
    src: Option<Location>,
    id: Option<u64>,
    _dst: Option<Location>,
    reply: Option<Reply>,
    ctx: &Context,
) {
    let reply = match reply {
        Some(r) => r,
        None => return,
    };

    match src {
        Some(origin) => {
            let echo = NetRequest {
                verb,
                kwargs: Kwargs::None,
                src: Some(origin),
                dst: None,
                auth: None,
                id,
                reply: None,
                timeout: None,
            };
            let auth = ctx
                .peer_table
                .get(origin.key())
                .and_then(|p| p.auth)
                .or_else(|| ctx.auth.auth_code());
            if let Err(e) = crate::reply::send_async_return(origin, echo, reply, auth, ctx.tls.as_ref()).await {
                debug!("could not send async return for {:?} to {}: {}", verb, origin, e);
            }
        }
        None => {
            let mut resp = NetRequest::new(verb, Kwargs::None);
            resp.reply = Some(reply);
            if let Err(e) = wire::send_msg(conn, &resp).await {
                debug!("could not send reply for {:?}: {}", verb, e);
            }
        }
    }
}

async fn dispatch_sync_verb(
    verb: Verb,
    kwargs: Kwargs,
    ctx: &Context,
    src: Option<Location>,
    dst: Option<Location>,
) -> Option<Reply> {
    match (verb, kwargs) {
        (Verb::Send, Kwargs::Send { coro, channel, message }) => {
            Some(Reply::Status(route_message(ctx, coro, channel, message)))
        }
        (Verb::Deliver, Kwargs::Deliver { coro, channel, message, n }) => {
            Some(Reply::Status(deliver_message(ctx, coro, channel, message, n).await))
        }
        (Verb::RunRci, Kwargs::RunRci { name, args, kwargs }) => {
            Some(rci::handle_run_rci(ctx, &name, args, kwargs).await)
        }
        (Verb::LocateCoro, Kwargs::LocateByName { name }) => locate_local(ctx, HandleKind::Coro, &name, src),
        (Verb::LocateChannel, Kwargs::LocateByName { name }) => locate_local(ctx, HandleKind::Channel, &name, src),
        (Verb::LocateRci, Kwargs::LocateByName { name }) => locate_local(ctx, HandleKind::Rci, &name, src),
        (Verb::LocatePeer, Kwargs::LocateByName { name }) => locate_peer(ctx, &name, dst),
        (Verb::Subscribe, Kwargs::Subscribe { channel, subscriber }) => {
            Some(Reply::Status(subscribe(ctx, &channel, subscriber, true)))
        }
        (Verb::Unsubscribe, Kwargs::Unsubscribe { channel, subscriber }) => {
            Some(Reply::Status(subscribe(ctx, &channel, subscriber, false)))
        }
        (Verb::Monitor, Kwargs::Monitor { coro, monitor }) => {
            Some(Reply::Status(install_monitor(ctx, coro, monitor)))
        }
        (Verb::Exception, Kwargs::Exception { coro, exc_type, exc_message }) => {
            Some(Reply::Status(inject_exception(ctx, coro, exc_type, exc_message)))
        }
        _ => Some(Reply::Error("unsupported verb/kwargs combination".into())),
    }
}

fn route_message(ctx: &Context, coro: Option<u64>, channel: Option<String>, message: KwValue) -> i32 {
    if let Some(id) = coro {
        return ctx.scheduler.coro(id).map(|c| c.send(message)).unwrap_or(-1);
    }
    if let Some(name) = channel {
        return ctx
            .registry
            .channel_by_name(&name)
            .map(|c| c.send(message))
            .unwrap_or(-1);
    }
    -1
}

async fn deliver_message(
    ctx: &Context,
    coro: Option<u64>,
    channel: Option<String>,
    message: KwValue,
    n: Option<usize>,
) -> i32 {
    if let Some(id) = coro {
        return ctx.scheduler.coro(id).map(|c| c.send(message)).unwrap_or(-1);
    }
    if let Some(name) = channel {
        if let Some(chan) = ctx.registry.channel_by_name(&name) {
            return chan.deliver(message, None, n).await;
        }
    }
    -1
}

/// Found locally -> `Some(Handle)` always. Not found: a direct (sync) call
/// still gets an explicit `Reply::None`, but a broadcast (`src` set) gets
/// nothing at all, since only the first positive answer among many peers
/// matters.
fn locate_local(ctx: &Context, kind: HandleKind, name: &str, src: Option<Location>) -> Option<Reply> {
    let handle = match kind {
        HandleKind::Coro => ctx.registry.coro_by_name(name).map(|c| c.handle()),
        HandleKind::Channel => ctx.registry.channel_by_name(name).map(|c| c.handle()),
        HandleKind::Rci => ctx.registry.rci_handler(name).map(|_| RemoteHandle {
            kind: HandleKind::Rci,
            id_or_name: name.to_string(),
            location: ctx.own_location,
        }),
    };
    match handle {
        Some(h) => Some(Reply::Handle(h)),
        None if src.is_some() => None,
        None => Some(Reply::None),
    }
}

/// `locate_peer`'s three-way ambiguity, keyed on `dst` (not
/// `src`): matches our own `name` -> our location; addressed to us by
/// location but name differs -> explicit null; neither -> nothing at all.
fn locate_peer(ctx: &Context, name: &str, dst: Option<Location>) -> Option<Reply> {
    if ctx.configured_name.as_deref() == Some(name) {
        Some(Reply::Location(ctx.own_location))
    } else if dst == Some(ctx.own_location) {
        Some(Reply::None)
    } else {
        None
    }
}

fn subscribe(ctx: &Context, channel: &str, subscriber: RemoteHandle, add: bool) -> i32 {
    match ctx.registry.channel_by_name(channel) {
        Some(chan) => {
            if add {
                chan.subscribe(subscriber)
            } else {
                chan.unsubscribe(&subscriber)
            }
        }
        None => -1,
    }
}

fn install_monitor(ctx: &Context, coro: RemoteHandle, monitor: RemoteHandle) -> i32 {
    if coro.location != ctx.own_location {
        return -1;
    }
    match coro.id_or_name.parse::<u64>() {
        Ok(id) => ctx.scheduler.install_monitor(id, monitor),
        Err(_) => -1,
    }
}

fn inject_exception(ctx: &Context, coro: RemoteHandle, exc_type: String, exc_message: String) -> i32 {
    if coro.location != ctx.own_location {
        return -1;
    }
    match coro.id_or_name.parse::<u64>() {
        Ok(id) => ctx.scheduler.throw(id, exc_type, exc_message),
        Err(_) => -1,
    }
}
