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

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Identifier of a scheduler instance: the address and port its TCP listener
/// is bound to (or its advertised external address, if `ext_ip_addr` is set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Location {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Key form used to index `PeerTable` and the stream-peer set.
    /// Port 0 means "any instance on that host", per the stream-peer sentinel.
    pub fn key(&self) -> (Ipv4Addr, u16) {
        (self.addr, self.port)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<std::net::SocketAddrV4> for Location {
    fn from(addr: std::net::SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}
