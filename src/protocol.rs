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

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthCode, Signature};
use crate::error::{NetError, NetResult};
use crate::location::Location;

/// Every instance in the mesh must run this exact string; a mismatch causes
/// the handshake to drop silently. There is no schema evolution across
/// versions — upgrade every instance together.
pub const PROTOCOL_VERSION: &str = "asyncoro-net-1";

/// The closed verb set. Every request on the wire is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Send,
    Deliver,
    RunRci,
    LocateCoro,
    LocateChannel,
    LocateRci,
    LocatePeer,
    Subscribe,
    Unsubscribe,
    Monitor,
    Exception,
    Ping,
    Pong,
    SendFile,
    DelFile,
    Terminate,
}

impl Verb {
    /// `ping` is the only verb allowed to bypass auth (bootstrap).
    pub fn bypasses_auth(self) -> bool {
        matches!(self, Verb::Ping)
    }
}

/// Loosely-typed value carried in RCI args/kwargs and routed messages,
/// covering the dynamic, fully-serializable value domain those need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KwValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<KwValue>),
    Map(HashMap<String, KwValue>),
}

/// Kind of a remote handle; see `RemoteHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleKind {
    Coro,
    Channel,
    Rci,
}

/// A serialisable reference to a `Coro`/`Channel`/`Rci` living at some
/// location. If `location` equals the receiver's own location, the
/// receiver should rebind it to the local object instead of treating it as
/// opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub kind: HandleKind,
    pub id_or_name: String,
    pub location: Location,
}

/// Ping/pong payload: `{location, signature, version}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingInfo {
    pub location: Location,
    pub signature: Option<Signature>,
    pub version: String,
}

/// Per-verb payload: one variant per verb, carrying exactly what that verb
/// needs instead of an untyped key/value bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Kwargs {
    Send {
        coro: Option<u64>,
        channel: Option<String>,
        message: KwValue,
    },
    Deliver {
        coro: Option<u64>,
        channel: Option<String>,
        message: KwValue,
        n: Option<usize>,
    },
    RunRci {
        name: String,
        args: Vec<KwValue>,
        kwargs: HashMap<String, KwValue>,
    },
    LocateByName {
        name: String,
    },
    Subscribe {
        channel: String,
        subscriber: RemoteHandle,
    },
    Unsubscribe {
        channel: String,
        subscriber: RemoteHandle,
    },
    Monitor {
        coro: RemoteHandle,
        monitor: RemoteHandle,
    },
    Exception {
        coro: RemoteHandle,
        exc_type: String,
        exc_message: String,
    },
    Ping(PingInfo),
    Pong(PingInfo),
    SendFile {
        file: String,
        stat_buf: FileStat,
        overwrite: bool,
        dest_path: Option<String>,
    },
    DelFile {
        file: String,
        dest_path: Option<String>,
    },
    Terminate {
        peer: Option<Location>,
    },
    None,
}

/// Mirrors the POSIX fields of `os.stat` that the file-transfer sub-protocol
/// compares and restores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub mode: u32,
}

impl FileStat {
    #[cfg(unix)]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            size: meta.size(),
            mtime: meta.mtime(),
            atime: meta.atime(),
            mode: meta.mode(),
        }
    }

    /// Tolerant comparison: timestamps within 1s, identical size,
    /// identical permission bits.
    pub fn matches(&self, other: &FileStat) -> bool {
        (self.mtime - other.mtime).abs() <= 1
            && self.size == other.size
            && (self.mode & 0o7777) == (other.mode & 0o7777)
    }
}

/// Every possible reply payload across all verbs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Status(i32),
    Handle(RemoteHandle),
    Location(Location),
    FileStatus(FileTransferStatus),
    Ack,
    Nak,
    Error(String),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FileTransferStatus {
    /// Transferred (or deleted) successfully.
    Ok,
    /// An identical file already exists at the destination; nothing sent.
    Skip,
    /// A different file already exists and `overwrite` was false; carries
    /// the destination's current stat so the caller can decide.
    Conflict(FileStat),
    Rejected,
}

/// The wire envelope carried on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetRequest {
    pub verb: Verb,
    pub kwargs: Kwargs,
    pub src: Option<Location>,
    pub dst: Option<Location>,
    pub auth: Option<AuthCode>,
    pub id: Option<u64>,
    pub reply: Option<Reply>,
    pub timeout: Option<Duration>,
}

impl NetRequest {
    pub fn new(verb: Verb, kwargs: Kwargs) -> Self {
        Self {
            verb,
            kwargs,
            src: None,
            dst: None,
            auth: None,
            id: None,
            reply: None,
            timeout: None,
        }
    }

    pub fn with_dst(mut self, dst: Location) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn with_src(mut self, src: Location) -> Self {
        self.src = Some(src);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

pub fn serialize(req: &NetRequest) -> NetResult<Vec<u8>> {
    Ok(bincode::serialize(req)?)
}

pub fn deserialize(bytes: &[u8]) -> NetResult<NetRequest> {
    bincode::deserialize(bytes).map_err(NetError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NetRequest {
        NetRequest {
            verb: Verb::LocateRci,
            kwargs: Kwargs::LocateByName {
                name: "hash_rci".into(),
            },
            src: Some(Location::new([127, 0, 0, 1].into(), 9000)),
            dst: Some(Location::new([127, 0, 0, 1].into(), 9001)),
            auth: Some(AuthCode::compute(&Signature::generate(), "secret")),
            id: Some(42),
            reply: None,
            timeout: Some(Duration::from_secs(2)),
        }
    }

    #[test]
    fn round_trips_every_field() {
        let req = sample();
        let bytes = serialize(&req).unwrap();
        let back = deserialize(&bytes).unwrap();

        assert_eq!(back.verb, req.verb);
        assert_eq!(back.src, req.src);
        assert_eq!(back.dst, req.dst);
        assert_eq!(back.auth, req.auth);
        assert_eq!(back.id, req.id);
        assert_eq!(back.reply, req.reply);
        assert_eq!(back.timeout, req.timeout);
        match (&back.kwargs, &req.kwargs) {
            (Kwargs::LocateByName { name: a }, Kwargs::LocateByName { name: b }) => {
                assert_eq!(a, b)
            }
            _ => panic!("kwargs variant mismatch"),
        }
    }

    #[test]
    fn file_stat_matches_within_one_second_mtime_tolerance() {
        let a = FileStat {
            size: 10,
            mtime: 1000,
            atime: 1000,
            mode: 0o644,
        };
        let b = FileStat {
            size: 10,
            mtime: 1001,
            atime: 2000,
            mode: 0o644,
        };
        assert!(a.matches(&b));

        let c = FileStat { size: 11, ..b };
        assert!(!a.matches(&c));
    }
}
