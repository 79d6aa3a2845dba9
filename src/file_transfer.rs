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

//! File transfer sub-protocol: a pre-flight metadata check (skip / reject /
//! overwrite) followed by a streamed payload phase. Sends never go through
//! the per-peer pipeline — each is a fresh, ad hoc TCP connection, since the
//! transfer holds the socket for the duration of the copy.

use std::net::{SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::dispatcher::Context;
use crate::error::{NetError, NetResult};
use crate::location::Location;
use crate::protocol::{FileStat, FileTransferStatus, Kwargs, NetRequest, Reply, Verb};
use crate::transport::{Transport, TlsMaterial};
use crate::wire;

/// Chunk size used by the receiver while reading the payload.
const RECV_CHUNK: usize = 10 * 1024 * 1024;
/// Chunk size used by the sender while streaming the payload.
const SEND_CHUNK: usize = 1024 * 1024;

/// Sender side of `send_file`: stats the local file, opens a fresh
/// connection to `location` (bypassing the per-peer worker), and drives
/// the two-phase exchange. Returns `-1` (as `FileTransferStatus::Rejected`)
/// on any local validation failure, matching the never-raise contract file
/// transfer verbs carry end to end.
pub async fn send_file(
    location: Location,
    auth: Option<crate::auth::AuthCode>,
    tls: Option<&TlsMaterial>,
    file: &Path,
    dest_path: Option<String>,
    overwrite: bool,
) -> FileTransferStatus {
    let meta = match fs::metadata(file).await {
        Ok(m) => m,
        Err(e) => {
            debug!("could not stat {}: {}", file.display(), e);
            return FileTransferStatus::Rejected;
        }
    };
    if !meta.is_file() {
        return FileTransferStatus::Rejected;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o400 == 0 {
            return FileTransferStatus::Rejected;
        }
    }

    let dest_path = match dest_path.map(|p| p.trim().to_string()) {
        Some(p) if !p.is_empty() => {
            if Path::new(&p).is_absolute() {
                return FileTransferStatus::Rejected;
            }
            Some(p)
        }
        _ => None,
    };

    let basename = match file.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_string(),
        None => return FileTransferStatus::Rejected,
    };
    let stat_buf = FileStat::from_metadata(&meta);

    let addr = SocketAddr::V4(SocketAddrV4::new(location.addr, location.port));
    let mut conn = match Transport::connect(addr, tls).await {
        Ok(c) => c,
        Err(e) => {
            debug!("could not connect to {} for send_file: {}", location, e);
            return FileTransferStatus::Rejected;
        }
    };

    let mut req = NetRequest::new(
        Verb::SendFile,
        Kwargs::SendFile {
            file: basename,
            stat_buf,
            overwrite,
            dest_path,
        },
    )
    .with_dst(location);
    req.auth = auth;

    if let Err(e) = wire::send_msg(&mut conn, &req).await {
        debug!("could not send send_file request to {}: {}", location, e);
        return FileTransferStatus::Rejected;
    }

    let status = match read_status(&mut conn).await {
        Ok(s) => s,
        Err(_) => return FileTransferStatus::Rejected,
    };

    if status != FileTransferStatus::Ok {
        return status;
    }

    let mut fd = match fs::File::open(file).await {
        Ok(f) => f,
        Err(_) => return FileTransferStatus::Rejected,
    };
    let mut buf = vec![0u8; SEND_CHUNK];
    loop {
        let n = match fd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("reading {} for transfer failed: {}", file.display(), e);
                return FileTransferStatus::Rejected;
            }
        };
        if let Err(e) = conn.write_all(&buf[..n]).await {
            debug!("sending file chunk to {} failed: {}", location, e);
            return FileTransferStatus::Rejected;
        }
    }

    match read_status(&mut conn).await {
        Ok(FileTransferStatus::Ok) => FileTransferStatus::Ok,
        _ => FileTransferStatus::Rejected,
    }
}

async fn read_status(conn: &mut Transport) -> NetResult<FileTransferStatus> {
    match wire::recv_msg(conn).await? {
        Some(NetRequest {
            reply: Some(Reply::FileStatus(status)),
            ..
        }) => Ok(status),
        _ => Err(NetError::MalformedPayload),
    }
}

fn reply_with(status: FileTransferStatus) -> NetRequest {
    let mut resp = NetRequest::new(Verb::SendFile, Kwargs::None);
    resp.reply = Some(Reply::FileStatus(status));
    resp
}

/// Resolves `dest_path`/`file` against `dest_path_prefix`, rejecting any
/// path that would escape the prefix after normalisation.
fn resolve_target(prefix: &Path, dest_path: Option<&str>, file: &str) -> Option<PathBuf> {
    let basename = Path::new(file).file_name()?.to_owned();
    let mut tgt = prefix.to_path_buf();
    if let Some(dest_path) = dest_path {
        tgt.push(dest_path);
    }
    tgt.push(basename);

    let normalized = normalize(&tgt);
    let normalized_prefix = normalize(prefix);
    if normalized.starts_with(&normalized_prefix) {
        Some(normalized)
    } else {
        None
    }
}

/// Lexical `..`/`.` resolution without touching the filesystem (the target
/// may not exist yet), so containment can be checked before any I/O.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Receiver side of `send_file`, driven by the dispatcher's connection
/// loop. Owns the entire exchange on `conn`: pre-flight reply, optional
/// payload read, final status.
pub async fn handle_send_file(conn: &mut Transport, kwargs: Kwargs, ctx: &Context) -> NetResult<()> {
    let (file, stat_buf, overwrite, dest_path) = match kwargs {
        Kwargs::SendFile {
            file,
            stat_buf,
            overwrite,
            dest_path,
        } => (file, stat_buf, overwrite, dest_path),
        _ => return Err(NetError::MalformedPayload),
    };

    let prefix = Path::new(ctx.dest_path_prefix.as_ref());
    let tgt = resolve_target(prefix, dest_path.as_deref(), &file);

    let status = match &tgt {
        None => FileTransferStatus::Rejected,
        Some(_) if ctx.max_file_size.map(|m| stat_buf.size > m).unwrap_or(false) => {
            warn!(
                "rejecting file \"{}\" ({} bytes): exceeds max_file_size",
                file, stat_buf.size
            );
            FileTransferStatus::Rejected
        }
        Some(tgt) => match fs::metadata(tgt).await {
            Ok(existing) => {
                let existing_stat = FileStat::from_metadata(&existing);
                if stat_buf.matches(&existing_stat) {
                    FileTransferStatus::Skip
                } else if !overwrite {
                    FileTransferStatus::Conflict(existing_stat)
                } else {
                    FileTransferStatus::Ok
                }
            }
            Err(_) => FileTransferStatus::Ok,
        },
    };

    // `tgt` is always `Some` whenever `status` isn't `Rejected`, since that's
    // the only branch that produces `Rejected` from a `None` target.
    let tgt = match (&status, tgt) {
        (FileTransferStatus::Rejected, _) => {
            wire::send_msg(conn, &reply_with(status)).await?;
            return Ok(());
        }
        (_, Some(t)) => t,
        _ => unreachable!(),
    };

    if status != FileTransferStatus::Ok {
        wire::send_msg(conn, &reply_with(status)).await?;
        return Ok(());
    }

    if let Some(parent) = tgt.parent() {
        if fs::create_dir_all(parent).await.is_err() {
            wire::send_msg(conn, &reply_with(FileTransferStatus::Rejected)).await?;
            return Ok(());
        }
    }
    let mut fd = match fs::File::create(&tgt).await {
        Ok(f) => f,
        Err(e) => {
            debug!("failed to create \"{}\": {}", tgt.display(), e);
            wire::send_msg(conn, &reply_with(FileTransferStatus::Rejected)).await?;
            return Ok(());
        }
    };

    wire::send_msg(conn, &reply_with(FileTransferStatus::Ok)).await?;

    let mut received: u64 = 0;
    let mut buf = vec![0u8; RECV_CHUNK];
    let mut failed = false;
    while received < stat_buf.size {
        let want = std::cmp::min(RECV_CHUNK as u64, stat_buf.size - received) as usize;
        let n = match conn.read(&mut buf[..want]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => {
                failed = true;
                break;
            }
        };
        if fd.write_all(&buf[..n]).await.is_err() {
            failed = true;
            break;
        }
        received += n as u64;
    }
    drop(fd);

    let final_status = if failed || received < stat_buf.size {
        let _ = fs::remove_file(&tgt).await;
        FileTransferStatus::Rejected
    } else {
        restore_metadata(&tgt, &stat_buf).await;
        debug!("saved file {}", tgt.display());
        FileTransferStatus::Ok
    };

    wire::send_msg(conn, &reply_with(final_status)).await?;
    Ok(())
}

#[cfg(unix)]
async fn restore_metadata(path: &Path, stat_buf: &FileStat) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, std::fs::Permissions::from_mode(stat_buf.mode & 0o7777)).await;
    let atime = filetime::FileTime::from_unix_time(stat_buf.atime, 0);
    let mtime = filetime::FileTime::from_unix_time(stat_buf.mtime, 0);
    let path = path.to_path_buf();
    let _ = tokio::task::spawn_blocking(move || filetime::set_file_times(&path, atime, mtime)).await;
}

#[cfg(not(unix))]
async fn restore_metadata(_path: &Path, _stat_buf: &FileStat) {}

/// `del_file`: recomputes the same target path as `send_file`, verifies
/// prefix containment, removes the file, then walks upward removing empty
/// directories up to (but not including) `dest_path_prefix`.
pub async fn handle_del_file(kwargs: Kwargs, ctx: &Context) -> Reply {
    let (file, dest_path) = match kwargs {
        Kwargs::DelFile { file, dest_path } => (file, dest_path),
        _ => return Reply::Status(-1),
    };

    let prefix = Path::new(ctx.dest_path_prefix.as_ref());
    let tgt = match resolve_target(prefix, dest_path.as_deref(), &file) {
        Some(t) => t,
        None => return Reply::Status(-1),
    };

    if fs::metadata(&tgt).await.map(|m| m.is_file()).unwrap_or(false) {
        if fs::remove_file(&tgt).await.is_err() {
            return Reply::Status(-1);
        }
        let mut dir = tgt.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == prefix || !d.starts_with(prefix) {
                break;
            }
            if fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Reply::Status(0)
    } else {
        Reply::Status(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn resolve_target_rejects_escaping_dest_path() {
        let prefix = Path::new("/tmp/asyncoro");
        assert!(resolve_target(prefix, Some("../../etc"), "passwd").is_none());
    }

    #[test]
    fn resolve_target_accepts_relative_subdirectory() {
        let prefix = Path::new("/tmp/asyncoro");
        let tgt = resolve_target(prefix, Some("sub"), "data").unwrap();
        assert_eq!(tgt, Path::new("/tmp/asyncoro/sub/data"));
    }

    #[test]
    fn resolve_target_rejects_dotdot_inside_dest_path() {
        let prefix = Path::new("/tmp/asyncoro");
        assert!(resolve_target(prefix, Some("sub/../../.."), "data").is_none());
    }

    fn test_context(dest_path_prefix: &std::path::Path, max_file_size: Option<u64>) -> Context {
        Context {
            own_location: Location::new([127, 0, 0, 1].into(), 9000),
            auth: Arc::new(crate::auth::AuthState::new(None)),
            registry: Arc::new(crate::registry::Registry::new(std::iter::empty())),
            scheduler: Arc::new(crate::scheduler::Scheduler::new(Location::new(
                [127, 0, 0, 1].into(),
                9000,
            ))),
            peer_table: Arc::new(crate::peer_table::PeerTable::new(None)),
            tls: None,
            dest_path_prefix: Arc::from(dest_path_prefix.to_str().unwrap()),
            max_file_size,
            configured_name: None,
        }
    }

    /// Property 5: sending the same file to the same peer twice replies
    /// `Ok` then `Skip` — the second transfer is a no-op because the
    /// destination's stat matches within tolerance.
    #[tokio::test]
    async fn sending_the_same_file_twice_is_idempotent() {
        use tokio::net::TcpListener;

        let dest_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("payload.bin");
        std::fs::write(&src_path, vec![7u8; 4096]).unwrap();

        let ctx = test_context(dest_dir.path(), None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let location = Location::new([127, 0, 0, 1].into(), server_addr.port());

        let run = |listener: TcpListener, ctx: Context| async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Transport::Plain(stream);
            let req = wire::recv_msg(&mut conn).await.unwrap().unwrap();
            handle_send_file(&mut conn, req.kwargs, &ctx).await.unwrap();
        };

        let server = tokio::spawn(run(listener, ctx));
        let first = send_file(location, None, None, &src_path, None, false).await;
        server.await.unwrap();
        assert_eq!(first, FileTransferStatus::Ok);
        assert!(dest_dir.path().join("payload.bin").exists());

        let listener = TcpListener::bind(server_addr).await.unwrap();
        let ctx = test_context(dest_dir.path(), None);
        let server = tokio::spawn(run(listener, ctx));
        let second = send_file(location, None, None, &src_path, None, false).await;
        server.await.unwrap();
        assert_eq!(second, FileTransferStatus::Skip);
    }
}
