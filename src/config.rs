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

use serde::Deserialize;

pub const DEFAULT_UDP_PORT: u16 = 51350;
pub const DEFAULT_DEST_PATH_PREFIX: &str = "/tmp/asyncoro";

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(rename(deserialize = "General"))]
    pub general: General,

    #[serde(rename(deserialize = "Tls"), default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct General {
    /// Bind address for the TCP listener (hostname or IP). Defaults to the
    /// local hostname-resolved IP when absent.
    #[serde(default)]
    pub node: Option<String>,

    /// UDP discovery port. 0 or absent selects `DEFAULT_UDP_PORT`.
    #[serde(default)]
    pub udp_port: u16,

    /// TCP listener port. 0 selects an ephemeral port.
    #[serde(default)]
    pub tcp_port: u16,

    /// Advertised external address, overriding the bound address once
    /// resolved (for instances behind NAT).
    #[serde(default)]
    pub ext_ip_addr: Option<String>,

    /// Unique peer name; defaults to "addr:port" when absent.
    #[serde(default)]
    pub name: Option<String>,

    /// Shared pre-shared secret. Absent disables authentication.
    #[serde(default)]
    pub secret: Option<String>,

    /// Root directory under which transferred files are written.
    #[serde(default)]
    pub dest_path_prefix: Option<String>,

    /// Maximum accepted file size in bytes. 0 or absent means no limit.
    #[serde(default)]
    pub max_file_size: u64,

    /// Peers to hold a persistent ("streamed") connection open to, as
    /// "addr:port" or "addr:0" (any instance on that host).
    #[serde(default)]
    pub stream_peers: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub certfile: String,
    pub keyfile: String,
}

impl General {
    pub fn resolved_udp_port(&self) -> u16 {
        if self.udp_port == 0 {
            DEFAULT_UDP_PORT
        } else {
            self.udp_port
        }
    }

    pub fn resolved_dest_path_prefix(&self) -> String {
        self.dest_path_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_DEST_PATH_PREFIX.to_string())
    }

    pub fn resolved_max_file_size(&self) -> Option<u64> {
        if self.max_file_size == 0 {
            None
        } else {
            Some(self.max_file_size)
        }
    }
}
