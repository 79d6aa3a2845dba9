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

//! `send_msg`/`recv_msg` framing: a 4-byte big-endian length prefix
//! followed by a `bincode`-serialized `NetRequest`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{NetError, NetResult};
use crate::protocol::{self, NetRequest};

/// Frames larger than this are rejected outright rather than allocated.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub async fn send_msg<W: AsyncWriteExt + Unpin>(writer: &mut W, req: &NetRequest) -> NetResult<()> {
    let payload = protocol::serialize(req)?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn recv_msg<R: AsyncReadExt + Unpin>(reader: &mut R) -> NetResult<Option<NetRequest>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(NetError::MalformedPayload);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(protocol::deserialize(&buf)?))
}

/// Sends a pre-serialized byte string (used for the `ack`/`nak` one-liners
/// the handshake exchanges instead of a full `NetRequest`).
pub async fn send_bytes<W: AsyncWriteExt + Unpin>(writer: &mut W, bytes: &[u8]) -> NetResult<()> {
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn recv_bytes<R: AsyncReadExt + Unpin>(reader: &mut R) -> NetResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(NetError::MalformedPayload);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
