//! Listening sockets of the daemon: the state observation socket and the port
//! state socket

use std::{
    fs::Permissions,
    io,
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::net::UnixListener;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("{0} exists and is not a socket")]
    NotASocket(PathBuf),
    #[error("directory of {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("could not bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Bind a unix socket at `path` with file mode `mode`.
///
/// A socket left behind by an earlier run is replaced, anything else at `path`
/// is left alone.
pub fn bind_unix_socket(path: &Path, mode: u32) -> Result<UnixListener, SocketError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path)?,
        Ok(_) => return Err(SocketError::NotASocket(path.to_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path).map_err(|source| {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
                SocketError::MissingDirectory(path.to_owned())
            }
            _ => SocketError::Bind {
                path: path.to_owned(),
                source,
            },
        }
    })?;

    std::fs::set_permissions(path, Permissions::from_mode(mode))?;
    log::debug!("listening on {} (mode {mode:o})", path.display());

    Ok(listener)
}
