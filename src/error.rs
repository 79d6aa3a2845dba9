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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("malformed payload")]
    MalformedPayload,

    #[error("auth mismatch")]
    AuthMismatch,

    #[error("mismatching protocol version, expected {expected}, received {received}")]
    VersionMismatch { expected: String, received: String },

    #[error("destination {0} does not match own location")]
    WrongDestination(String),

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("name \"{0}\" is already registered")]
    AlreadyRegistered(String),

    #[error("not the owner of this handle")]
    NotOwner,

    #[error("path escapes dest_path_prefix")]
    PathEscapesPrefix,

    #[error("dest_path must be relative, got \"{0}\"")]
    AbsoluteDestPath(String),

    #[error("file exceeds max_file_size ({size} > {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("could not bind TCP listener (ephemeral port resolved to 0)")]
    EphemeralBindFailed,

    #[error("TLS error {0}")]
    TlsError(String),

    #[error("request timed out")]
    Timeout,
}

impl NetError {
    /// Numeric code mirrored into file-transfer / dispatch replies, which
    /// report failure as a sentinel value rather than propagating an error.
    pub fn code(&self) -> u8 {
        match self {
            NetError::MalformedPayload => 0,
            NetError::AuthMismatch => 1,
            NetError::VersionMismatch { .. } => 2,
            NetError::WrongDestination(_) => 3,
            NetError::UnknownPeer(_) => 4,
            NetError::AlreadyRegistered(_) => 5,
            NetError::NotOwner => 6,
            NetError::PathEscapesPrefix => 7,
            NetError::AbsoluteDestPath(_) => 8,
            NetError::FileTooLarge { .. } => 9,
            NetError::Timeout => 10,
            _ => 255,
        }
    }
}

pub type NetResult<T> = std::result::Result<T, NetError>;
