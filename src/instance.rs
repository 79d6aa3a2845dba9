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

//! The instance: owns `Location`, auth state, registry, scheduler, and peer
//! table, and drives the UDP/TCP accept loops that tie every other module
//! together. Construct-then-run shape binds listeners up front and hands
//! off to a long-running accept loop, plus a second (UDP) listener and a
//! relay-forwarding arm for channel/monitor delivery to remote subscribers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::net::{TcpListener, UdpSocket};

use crate::auth::AuthState;
use crate::config::Config;
use crate::discovery;
use crate::dispatcher::{self, Context};
use crate::error::{NetError, NetResult};
use crate::file_transfer;
use crate::location::Location;
use crate::peer_table::PeerTable;
use crate::protocol::{FileTransferStatus, HandleKind, KwValue, Kwargs, NetRequest, RemoteHandle, Reply, Verb};
use crate::registry::Registry;
use crate::rci;
use crate::reply;
use crate::scheduler::{LocalChannel, RciHandler, RelayMessage, Scheduler};
use crate::transport::{Transport, TlsMaterial};

pub struct Instance {
    location: Location,
    auth: Arc<AuthState>,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    peer_table: Arc<PeerTable>,
    tls: Option<TlsMaterial>,
    dest_path_prefix: Arc<str>,
    max_file_size: Option<u64>,
    configured_name: Option<String>,
    udp_port: u16,
    listener: TcpListener,
    udp_socket: Arc<UdpSocket>,
}

impl Instance {
    /// Binds the TCP and UDP listeners and computes the advertised
    /// `Location`, but does not yet accept connections or broadcast — call
    /// `up()` to start the event loop. Startup fails if the ephemeral TCP
    /// port somehow resolves to 0 (§7 "fatal instance errors").
    pub async fn new(config: Config) -> NetResult<Arc<Instance>> {
        let general = config.general;

        let node_addr = resolve_own_addr(general.node.as_deref())?;
        let tcp_addr = SocketAddr::V4(SocketAddrV4::new(node_addr, general.tcp_port));
        let listener = TcpListener::bind(tcp_addr).await?;
        let bound_port = listener.local_addr()?.port();
        if bound_port == 0 {
            return Err(NetError::EphemeralBindFailed);
        }

        let mut location = Location::new(node_addr, bound_port);
        if let Some(ext) = general.ext_ip_addr.as_deref() {
            location.addr = resolve_hostname(ext)?;
        }

        let udp_port = general.resolved_udp_port();
        let udp_socket = Arc::new(discovery::bind_udp(udp_port)?);

        let tls = match &config.tls {
            Some(tls_cfg) => Some(TlsMaterial::load(tls_cfg)?),
            None => None,
        };

        let auth = Arc::new(AuthState::new(general.secret.clone()));
        let registry = Arc::new(Registry::new(parse_stream_peers(&general.stream_peers)));
        let scheduler = Arc::new(Scheduler::new(location));
        let peer_table = Arc::new(PeerTable::new(tls.clone()));
        let configured_name = Some(general.name.clone().unwrap_or_else(|| location.to_string()));

        Ok(Arc::new(Instance {
            location,
            auth,
            registry,
            scheduler,
            peer_table,
            tls,
            dest_path_prefix: Arc::from(general.resolved_dest_path_prefix()),
            max_file_size: general.resolved_max_file_size(),
            configured_name,
            udp_port,
            listener,
            udp_socket,
        }))
    }

    pub fn location(&self) -> Location {
        self.location
    }

    fn context(&self) -> Context {
        Context {
            own_location: self.location,
            auth: self.auth.clone(),
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            peer_table: self.peer_table.clone(),
            tls: self.tls.clone(),
            dest_path_prefix: self.dest_path_prefix.clone(),
            max_file_size: self.max_file_size,
            configured_name: self.configured_name.clone(),
        }
    }

    /// Runs forever: broadcasts the initial UDP ping, spawns the UDP
    /// listener, then loops accepting TCP connections and forwarding
    /// locally-queued relay traffic (remote channel subscribers, remote
    /// monitors) onto the peer table, until `ctrl_c`.
    pub async fn up(self: Arc<Self>) -> NetResult<()> {
        std::fs::create_dir_all(self.dest_path_prefix.as_ref())?;

        info!(
            "instance {} listening (tcp {}, udp {})",
            self.configured_name.as_deref().unwrap_or(""),
            self.location,
            self.udp_port
        );

        discovery::broadcast_ping(&self.udp_socket, self.udp_port, self.location, &self.auth).await;

        tokio::spawn(discovery::run_udp_listener(
            self.udp_socket.clone(),
            self.location,
            self.auth.clone(),
            self.peer_table.clone(),
            self.tls.clone(),
        ));

        let mut relay_rx = self
            .scheduler
            .take_relay_receiver()
            .expect("relay receiver already taken");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("peer connected ({})", addr);
                            let ctx = self.context();
                            let tls = self.tls.clone();
                            tokio::spawn(async move {
                                match Transport::accept(stream, tls.as_ref()).await {
                                    Ok(conn) => dispatcher::handle_connection(conn, ctx).await,
                                    Err(e) => debug!("tls accept from {} failed: {}", addr, e),
                                }
                            });
                        }
                        Err(e) => debug!("accept error: {}", e),
                    }
                }
                Some(relay) = relay_rx.recv() => {
                    self.forward_relay(relay).await;
                }
            }
        }
    }

    /// Delivers a relay message (a channel fan-out to a remote subscriber,
    /// or a coro's exit status to a remote monitor) onto the wire as a
    /// plain `send`. Targets at our own location are handled defensively
    /// in-process, though in practice `LocalChannel`/`LocalCoro` deliver
    /// those directly without ever touching the relay queue.
    async fn forward_relay(&self, relay: RelayMessage) {
        if relay.target.location == self.location {
            match relay.target.kind {
                HandleKind::Coro => {
                    if let Ok(id) = relay.target.id_or_name.parse() {
                        if let Some(coro) = self.scheduler.coro(id) {
                            coro.send(relay.message);
                        }
                    }
                }
                HandleKind::Channel => {
                    if let Some(chan) = self.registry.channel_by_name(&relay.target.id_or_name) {
                        chan.send(relay.message);
                    }
                }
                HandleKind::Rci => {}
            }
            return;
        }

        let kwargs = match relay.target.kind {
            HandleKind::Coro => Kwargs::Send {
                coro: relay.target.id_or_name.parse().ok(),
                channel: None,
                message: relay.message,
            },
            HandleKind::Channel => Kwargs::Send {
                coro: None,
                channel: Some(relay.target.id_or_name.clone()),
                message: relay.message,
            },
            HandleKind::Rci => return,
        };
        let req = NetRequest::new(Verb::Send, kwargs).with_dst(relay.target.location);
        let _ = reply::sync_reply(&self.peer_table, req).await;
    }

    // -- registration -----------------------------------------------------

    pub fn register_channel(&self, name: &str) -> NetResult<Arc<LocalChannel>> {
        let channel = Arc::new(self.scheduler.new_channel(name));
        self.registry.register_channel(name, channel.clone())?;
        Ok(channel)
    }

    pub fn unregister_channel(&self, name: &str) -> NetResult<()> {
        self.registry.unregister_channel(name)
    }

    pub fn register_rci(&self, name: &str, handler: Arc<dyn RciHandler>) -> NetResult<()> {
        rci::register(&self.registry, name, handler)
    }

    pub fn unregister_rci(&self, name: &str) -> NetResult<()> {
        rci::unregister(&self.registry, name)
    }

    // -- location / rci ----------------------------------------------------

    /// `locate_peer`: a sync lookup of another instance by its configured
    /// `name` at a known `(addr, port)`.
    pub async fn locate_peer(&self, location: Location, name: &str, timeout: Option<Duration>) -> Option<Location> {
        let req = NetRequest::new(Verb::LocatePeer, Kwargs::LocateByName { name: name.to_string() })
            .with_dst(location)
            .with_timeout(timeout);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Location(loc)) => Some(loc),
            _ => None,
        }
    }

    pub async fn locate_rci(
        &self,
        name: &str,
        location: Option<Location>,
        timeout: Option<Duration>,
    ) -> Option<RemoteHandle> {
        rci::locate(
            self.location,
            &self.registry,
            &self.peer_table,
            self.tls.as_ref(),
            name,
            location,
            timeout,
        )
        .await
    }

    pub async fn call_rci(
        &self,
        handle: &RemoteHandle,
        args: Vec<KwValue>,
        kwargs: std::collections::HashMap<String, KwValue>,
    ) -> Result<Option<RemoteHandle>, String> {
        rci::invoke(
            self.location,
            &self.registry,
            &self.scheduler,
            &self.peer_table,
            handle,
            args,
            kwargs,
        )
        .await
    }

    // -- messaging ----------------------------------------------------------

    pub async fn send(&self, location: Location, coro: Option<u64>, channel: Option<String>, message: KwValue) -> i32 {
        let req = NetRequest::new(Verb::Send, Kwargs::Send { coro, channel, message }).with_dst(location);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Status(code)) => code,
            _ => -1,
        }
    }

    pub async fn deliver(
        &self,
        location: Location,
        coro: Option<u64>,
        channel: Option<String>,
        message: KwValue,
        n: Option<usize>,
        timeout: Option<Duration>,
    ) -> i32 {
        let req = NetRequest::new(Verb::Deliver, Kwargs::Deliver { coro, channel, message, n })
            .with_dst(location)
            .with_timeout(timeout);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Status(code)) => code,
            _ => -1,
        }
    }

    pub async fn subscribe(&self, location: Location, channel: &str, subscriber: RemoteHandle) -> i32 {
        let req = NetRequest::new(
            Verb::Subscribe,
            Kwargs::Subscribe {
                channel: channel.to_string(),
                subscriber,
            },
        )
        .with_dst(location);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Status(code)) => code,
            _ => -1,
        }
    }

    pub async fn unsubscribe(&self, location: Location, channel: &str, subscriber: RemoteHandle) -> i32 {
        let req = NetRequest::new(
            Verb::Unsubscribe,
            Kwargs::Unsubscribe {
                channel: channel.to_string(),
                subscriber,
            },
        )
        .with_dst(location);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Status(code)) => code,
            _ => -1,
        }
    }

    pub async fn monitor(&self, coro: RemoteHandle, monitor: RemoteHandle) -> i32 {
        let location = coro.location;
        let req = NetRequest::new(Verb::Monitor, Kwargs::Monitor { coro, monitor }).with_dst(location);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Status(code)) => code,
            _ => -1,
        }
    }

    pub async fn raise_exception(&self, coro: RemoteHandle, exc_type: String, exc_message: String) -> i32 {
        let location = coro.location;
        let req = NetRequest::new(
            Verb::Exception,
            Kwargs::Exception {
                coro,
                exc_type,
                exc_message,
            },
        )
        .with_dst(location);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Status(code)) => code,
            _ => -1,
        }
    }

    // -- file transfer --------------------------------------------------------

    pub async fn send_file(
        &self,
        location: Location,
        file: &Path,
        dest_path: Option<String>,
        overwrite: bool,
    ) -> FileTransferStatus {
        let auth = self
            .peer_table
            .get(location.key())
            .and_then(|p| p.auth)
            .or_else(|| self.auth.auth_code());
        file_transfer::send_file(location, auth, self.tls.as_ref(), file, dest_path, overwrite).await
    }

    pub async fn del_file(&self, location: Location, file: &str, dest_path: Option<String>) -> i32 {
        let req = NetRequest::new(
            Verb::DelFile,
            Kwargs::DelFile {
                file: file.to_string(),
                dest_path,
            },
        )
        .with_dst(location);
        match reply::sync_reply(&self.peer_table, req).await {
            Some(Reply::Status(code)) => code,
            _ => -1,
        }
    }

    // -- teardown -------------------------------------------------------------

    /// `terminate`: asks the remote peer to drop us from its table, then
    /// drops it from ours. Returns whether the remote acknowledged.
    pub async fn terminate(&self, location: Location) -> bool {
        let req = NetRequest::new(Verb::Terminate, Kwargs::Terminate { peer: Some(self.location) }).with_dst(location);
        let acked = matches!(reply::sync_reply(&self.peer_table, req).await, Some(Reply::Ack));
        self.peer_table.remove(location);
        acked
    }
}

fn parse_stream_peers(entries: &[String]) -> Vec<(Ipv4Addr, u16)> {
    entries
        .iter()
        .filter_map(|entry| {
            let (addr, port) = entry.split_once(':')?;
            let addr: Ipv4Addr = addr.parse().ok()?;
            let port: u16 = port.parse().unwrap_or(0);
            Some((addr, port))
        })
        .collect()
}

fn resolve_hostname(host: &str) -> std::io::Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    (host, 0u16)
        .to_socket_addrs()?
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            _ => None,
        })
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("could not resolve {}", host)))
}

/// No `node` configured: ask the OS which local address it would use to
/// reach the outside world by connecting a UDP socket without ever sending
/// a datagram, instead of trusting `gethostname()` (which can resolve to
/// loopback on misconfigured hosts).
fn local_outbound_addr() -> std::io::Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => Err(std::io::Error::new(std::io::ErrorKind::Other, "no IPv4 local address")),
    }
}

fn resolve_own_addr(node: Option<&str>) -> NetResult<Ipv4Addr> {
    match node {
        Some(host) => Ok(resolve_hostname(host)?),
        None => Ok(local_outbound_addr()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_peer_entries_with_explicit_and_any_port() {
        let parsed = parse_stream_peers(&["10.0.0.1:9000".to_string(), "10.0.0.2:0".to_string()]);
        assert_eq!(
            parsed,
            vec![(Ipv4Addr::new(10, 0, 0, 1), 9000), (Ipv4Addr::new(10, 0, 0, 2), 0)]
        );
    }

    #[test]
    fn ignores_malformed_stream_peer_entries() {
        assert!(parse_stream_peers(&["not-an-entry".to_string()]).is_empty());
    }
}
