use std::time::Instant;

use phcsync::{
    extts::ExtTsDevice,
    reference::SystemClock,
    servo::{Servo, ServoState},
    topology::PortState,
    SyncOrchestrator,
};
use serde::Serialize;
use tokio::{io::AsyncWriteExt, net::UnixStream, sync::watch, task::JoinHandle};

use crate::{
    config::ObservabilityConfig,
    socket::{bind_unix_socket, SocketError},
};

/// Snapshot of the daemon published on the observation socket
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ObservableState {
    pub program: ProgramData,
    pub clocks: Vec<ObservableClock>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProgramData {
    pub version: String,
    pub uptime_seconds: f64,
}

impl ProgramData {
    fn with_uptime(uptime_seconds: f64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClockRole {
    /// Other clocks are synchronized to this clock
    Source,
    /// Synchronized to the reference or the source
    Destination,
    Idle,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ObservableClock {
    pub name: String,
    pub index: u32,
    pub role: ClockRole,
    pub servo_state: ServoState,
    pub port_state: Option<PortState>,
    /// Offset to the source at the last sample (nanoseconds)
    pub last_offset: Option<i64>,
    /// Frequency last written to the clock (ppb)
    pub last_frequency: Option<f64>,
}

/// Collect the state of every clock of `orchestrator`
pub fn observe_clocks<D, S, C, F>(orchestrator: &SyncOrchestrator<D, S, C, F>) -> Vec<ObservableClock>
where
    D: ExtTsDevice,
    S: Servo,
    C: SystemClock,
    F: FnMut(&mut D) -> Result<S, D::Error>,
{
    let source = orchestrator.source_clock();

    orchestrator
        .registry()
        .iter()
        .map(|(id, clock)| ObservableClock {
            name: clock.name().to_string(),
            index: clock.index(),
            role: if source == Some(id) {
                ClockRole::Source
            } else if clock.is_destination() {
                ClockRole::Destination
            } else {
                ClockRole::Idle
            },
            servo_state: clock.servo_state(),
            port_state: clock.port_state(),
            last_offset: clock.last_offset().map(|offset| offset.nanos()),
            last_frequency: clock.last_frequency(),
        })
        .collect()
}

pub fn spawn(
    config: &ObservabilityConfig,
    clocks: watch::Receiver<Vec<ObservableClock>>,
) -> JoinHandle<Result<(), SocketError>> {
    let config = config.clone();
    tokio::spawn(async move {
        let result = observer(config, clocks).await;
        if let Err(ref e) = result {
            log::warn!("Abnormal termination of the state observer: {e}");
            log::warn!("The state observer will not be available");
        }
        result
    })
}

async fn observer(
    config: ObservabilityConfig,
    clocks: watch::Receiver<Vec<ObservableClock>>,
) -> Result<(), SocketError> {
    let start_time = Instant::now();

    let path = match config.observation_path {
        Some(path) => path,
        None => return Ok(()),
    };

    // the daemon runs as root to be able to adjust the clocks, but readers of
    // the socket should not need to
    let listener = bind_unix_socket(&path, config.observation_permissions)?;

    loop {
        let (mut stream, _addr) = listener.accept().await?;

        let observe = ObservableState {
            program: ProgramData::with_uptime(start_time.elapsed().as_secs_f64()),
            clocks: clocks.borrow().clone(),
        };

        write_json(&mut stream, &observe).await?;
    }
}

pub async fn write_json<T>(stream: &mut UnixStream, value: &T) -> std::io::Result<()>
where
    T: serde::Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    stream.write_all(&bytes).await
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn clock() -> ObservableClock {
        ObservableClock {
            name: "/dev/ptp1".into(),
            index: 1,
            role: ClockRole::Destination,
            servo_state: ServoState::Locked,
            port_state: Some(PortState::Master),
            last_offset: Some(-12),
            last_frequency: Some(340.0),
        }
    }

    #[test]
    fn clock_json() {
        let json = serde_json::to_value(clock()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "/dev/ptp1",
                "index": 1,
                "role": "destination",
                "servo-state": "locked",
                "port-state": "master",
                "last-offset": -12,
                "last-frequency": 340.0,
            })
        );
    }

    #[tokio::test]
    async fn publishes_snapshot() {
        let path = std::env::temp_dir().join(format!("phcsync-observe-{}", std::process::id()));
        let config = ObservabilityConfig {
            observation_path: Some(path.clone()),
            observation_permissions: 0o600,
        };

        let (tx, rx) = watch::channel(Vec::new());
        tx.send_replace(vec![clock()]);
        let handle = spawn(&config, rx);

        let mut stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::task::yield_now().await,
            }
        };

        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["clocks"][0]["name"], "/dev/ptp1");
        assert_eq!(value["program"]["version"], env!("CARGO_PKG_VERSION"));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        handle.abort();
        let _ = std::fs::remove_file(path);
    }
}
