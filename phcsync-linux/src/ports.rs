//! Port state notifications from a PTP daemon
//!
//! The daemon (or a small script watching it) connects to a unix socket and
//! writes one JSON object per line, for example `{"port": 1, "state": 9}` or
//! `{"port": 1, "state": "slave"}`.

use std::path::PathBuf;

use phcsync::topology::PortState;
use serde::{de::Error, Deserialize, Deserializer};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::UnixStream,
    sync::mpsc,
    task::JoinHandle,
};

use crate::socket::{bind_unix_socket, SocketError};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortStateUpdate {
    pub port: u16,
    #[serde(deserialize_with = "port_state")]
    pub state: PortState,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPortState {
    Number(u8),
    Name(PortState),
}

fn port_state<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PortState, D::Error> {
    match RawPortState::deserialize(deserializer)? {
        RawPortState::Number(number) => PortState::try_from(number)
            .map_err(|_| D::Error::custom(format!("unknown port state {number}"))),
        RawPortState::Name(state) => Ok(state),
    }
}

pub fn spawn(
    path: PathBuf,
    updates: mpsc::Sender<PortStateUpdate>,
) -> JoinHandle<Result<(), SocketError>> {
    tokio::spawn(async move {
        let result = listen(path, updates).await;
        if let Err(ref e) = result {
            log::warn!("Abnormal termination of the port state listener: {e}");
        }
        result
    })
}

async fn listen(
    path: PathBuf,
    updates: mpsc::Sender<PortStateUpdate>,
) -> Result<(), SocketError> {
    // only the PTP daemon, running as root as well, may change port states
    let listener = bind_unix_socket(&path, 0o600)?;

    loop {
        let (stream, _addr) = listener.accept().await?;
        let updates = updates.clone();
        tokio::spawn(async move {
            if let Err(e) = read_updates(stream, updates).await {
                log::warn!("Port state connection failed: {e}");
            }
        });
    }
}

async fn read_updates(
    stream: UnixStream,
    updates: mpsc::Sender<PortStateUpdate>,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<PortStateUpdate>(&line) {
            Ok(update) => {
                log::debug!("port {} reported state {:?}", update.port, update.state);
                if updates.send(update).await.is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Ignoring invalid port state update {line:?}: {e}"),
        }
    }

    Ok(())
}
