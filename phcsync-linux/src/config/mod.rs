use std::{
    collections::HashSet,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::warn;
use phcsync::{
    config::{SourceConfig, SyncConfig},
    servo::{PiServoConfig, ServoStateConfig},
    sync::ratio::RatioSyncConfig,
    topology::PortState,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::{fs::read_to_string, io};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/phcsync/phcsync.toml";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default)]
    pub servo: ServoConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceConfig>,
    #[serde(rename = "port", default)]
    pub ports: Vec<PortConfig>,
    /// A switch clock behind a management bus, steered to a local clock
    #[serde(default)]
    pub bus: Option<BusConfig>,
    /// Unix socket on which a PTP daemon reports port state changes
    #[serde(default)]
    pub port_state_path: Option<PathBuf>,
    /// Path of the socket on which the state is published
    #[serde(default)]
    pub observation_path: Option<PathBuf>,
    #[serde(default = "default_observation_permissions")]
    pub observation_permissions: u32,
}

/// Gains and lock thresholds shared by the servos of all clocks
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServoConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_first_step_threshold")]
    pub first_step_threshold: i64,
    #[serde(default)]
    pub step_threshold: i64,
    #[serde(default)]
    pub stable_offset_threshold: i64,
    #[serde(default = "default_stable_sample_count")]
    pub stable_sample_count: u32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        let pi = PiServoConfig::default();
        let lock = ServoStateConfig::default();
        Self {
            kp: pi.kp,
            ki: pi.ki,
            first_step_threshold: lock.first_step_threshold,
            step_threshold: lock.step_threshold,
            stable_offset_threshold: lock.stable_offset_threshold,
            stable_sample_count: lock.stable_sample_count,
        }
    }
}

impl ServoConfig {
    pub fn pi(&self) -> PiServoConfig {
        PiServoConfig {
            kp: self.kp,
            ki: self.ki,
        }
    }

    pub fn lock(&self) -> ServoStateConfig {
        ServoStateConfig {
            first_step_threshold: self.first_step_threshold,
            step_threshold: self.step_threshold,
            stable_offset_threshold: self.stable_offset_threshold,
            stable_sample_count: self.stable_sample_count,
        }
    }
}

fn default_kp() -> f64 {
    PiServoConfig::default().kp
}

fn default_ki() -> f64 {
    PiServoConfig::default().ki
}

fn default_first_step_threshold() -> i64 {
    ServoStateConfig::default().first_step_threshold
}

fn default_stable_sample_count() -> u32 {
    ServoStateConfig::default().stable_sample_count
}

/// Where the pulses come from
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    tag = "type",
    deny_unknown_fields
)]
pub enum ReferenceConfig {
    /// A 1-PPS signal aligned with the second of the system clock
    Generic {
        /// TAI - UTC (seconds)
        #[serde(default = "default_utc_offset")]
        utc_offset: i64,
    },
    /// The periodic output of a local hardware clock
    Phc { device: String },
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig::Generic {
            utc_offset: default_utc_offset(),
        }
    }
}

fn default_utc_offset() -> i64 {
    phcsync::reference::DEFAULT_UTC_OFFSET.nanos() / 1_000_000_000
}

/// A port of a PTP daemon and the clock it is bound to
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PortConfig {
    pub number: u16,
    pub device: String,
    #[serde(default = "default_port_state")]
    pub state: PortState,
}

fn default_port_state() -> PortState {
    PortState::Initializing
}

/// An SJA1105 switch reached over spidev
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BusConfig {
    #[serde(default = "default_spi_device")]
    pub spi_device: PathBuf,
    #[serde(default = "default_spi_speed_hz")]
    pub spi_speed_hz: u32,
    /// The local clock the switch follows
    pub reference: String,
    #[serde(default)]
    pub ratio: RatioSyncConfig,
}

fn default_spi_device() -> PathBuf {
    PathBuf::from("/dev/spidev0.1")
}

fn default_spi_speed_hz() -> u32 {
    1_000_000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub observation_path: Option<PathBuf>,
    pub observation_permissions: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            observation_path: None,
            observation_permissions: default_observation_permissions(),
        }
    }
}

const fn default_observation_permissions() -> u32 {
    0o666
}

fn default_loglevel() -> String {
    "info".into()
}

impl Config {
    /// Parse config from file
    pub async fn from_file(file: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let meta = std::fs::metadata(&file)?;
        let perm = meta.permissions();

        if perm.mode() as libc::mode_t & libc::S_IWOTH != 0 {
            warn!("Unrestricted config file permissions: Others can write.");
        }

        let contents = read_to_string(file).await?;
        Ok(toml::de::from_str(&contents)?)
    }

    /// Settings of the state observation socket
    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig {
            observation_path: self.observation_path.clone(),
            observation_permissions: self.observation_permissions,
        }
    }

    /// The configured log level
    pub fn log_level(&self) -> Option<log::LevelFilter> {
        log::LevelFilter::from_str(&self.loglevel).ok()
    }

    /// Check that the config is reasonable
    pub fn check(&self) -> bool {
        let mut ok = true;

        if self.log_level().is_none() {
            warn!("Unknown log level {:?}.", self.loglevel);
            ok = false;
        }

        if self.sources.is_empty() {
            warn!("No sources configured.");
            ok = false;
        }

        let mut devices = HashSet::new();
        for source in &self.sources {
            if !devices.insert(source.device.as_str()) {
                warn!("Source {} is configured more than once.", source.device);
                ok = false;
            }

            if source.pulse_width <= 0 || source.pulse_width >= 1_000_000_000 {
                warn!(
                    "Pulse width of source {} must be between 0 and 1 second.",
                    source.device
                );
                ok = false;
            }
        }

        let mut ports = HashSet::new();
        for port in &self.ports {
            if !ports.insert(port.number) {
                warn!("Port {} is configured more than once.", port.number);
                ok = false;
            }
        }

        if self.sync.sample_weight <= 0.0 {
            warn!("The sample weight must be positive.");
            ok = false;
        }

        if self.servo.kp < 0.0 || self.servo.ki < 0.0 {
            warn!("Servo gains must not be negative.");
            ok = false;
        }

        if let Some(bus) = &self.bus {
            if bus.ratio.max_offset <= 0 {
                warn!("The maximum offset of the bus clock must be positive.");
                ok = false;
            }

            if bus.ratio.sync_period_ms == 0 {
                warn!("The sync period of the bus clock must be positive.");
                ok = false;
            }
        }

        ok
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error while reading config: {0}")]
    Io(#[from] io::Error),
    #[error("config toml parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use phcsync::{extts::EdgePolarity, topology::FallbackPolicy};

    use super::*;

    fn parse(contents: &str) -> Config {
        toml::de::from_str(contents).unwrap()
    }

    const MINIMAL: &str = r#"
[[source]]
device = "/dev/ptp0"
"#;

    #[test]
    fn minimal() {
        let config = parse(MINIMAL);
        assert!(config.check());

        assert_eq!(config.loglevel, "info");
        assert_eq!(config.servo, ServoConfig::default());
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.reference, ReferenceConfig::Generic { utc_offset: 37 });
        assert_eq!(config.sources, vec![SourceConfig::new("/dev/ptp0")]);
        assert!(config.ports.is_empty());
        assert_eq!(config.bus, None);
        assert_eq!(config.observability(), ObservabilityConfig::default());
    }

    #[test]
    fn everything() {
        let config = parse(
            r#"
loglevel = "debug"
port-state-path = "/run/phcsync/ports"
observation-path = "/run/phcsync/observe"
observation-permissions = 0o640

[servo]
kp = 0.7
ki = 0.3
first-step-threshold = 0
stable-offset-threshold = 100
stable-sample-count = 4

[sync]
sample-weight = 0.5
free-running = true
poll-timeout-ms = 1500
perout-phase = 250000000
fallback = "disabled"

[reference]
type = "phc"
device = "/dev/ptp2"

[[source]]
device = "eth0"
pin-index = 1
channel = 1
polarity = "both"
correction = -120
pulse-width = 100000000

[[source]]
device = "/dev/ptp1"

[[port]]
number = 1
device = "eth0"
state = "slave"

[[port]]
number = 2
device = "/dev/ptp1"
"#,
        );
        assert!(config.check());

        assert_eq!(config.log_level(), Some(log::LevelFilter::Debug));
        assert_eq!(config.servo.pi(), PiServoConfig { kp: 0.7, ki: 0.3 });
        assert_eq!(
            config.servo.lock(),
            ServoStateConfig {
                first_step_threshold: 0,
                step_threshold: 0,
                stable_offset_threshold: 100,
                stable_sample_count: 4,
            }
        );
        assert_eq!(
            config.sync,
            SyncConfig {
                sample_weight: 0.5,
                free_running: true,
                poll_timeout_ms: 1500,
                perout_phase: 250_000_000,
                fallback: FallbackPolicy::Disabled,
            }
        );
        assert_eq!(
            config.reference,
            ReferenceConfig::Phc {
                device: "/dev/ptp2".into()
            }
        );
        assert_eq!(
            config.sources[0],
            SourceConfig {
                device: "eth0".into(),
                pin_index: 1,
                channel: 1,
                polarity: EdgePolarity::Both,
                correction: -120,
                pulse_width: 100_000_000,
            }
        );
        assert_eq!(config.ports[0].state, PortState::Slave);
        assert_eq!(config.ports[1].state, PortState::Initializing);
        assert_eq!(
            config.port_state_path.as_deref(),
            Some(Path::new("/run/phcsync/ports"))
        );
        assert_eq!(config.observability().observation_permissions, 0o640);
    }

    #[test]
    fn shipped_default_config() {
        let config = parse(include_str!("../../docs/phcsync.toml.default"));
        assert!(config.check());
        assert_eq!(config.servo, ServoConfig::default());
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.reference, ReferenceConfig::default());
        assert_eq!(config.sources, vec![SourceConfig::new("/dev/ptp0")]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::de::from_str::<Config>("frobnicate = 1\n").is_err());
        assert!(toml::de::from_str::<Config>("[servo]\nkd = 0.1\n").is_err());
        assert!(toml::de::from_str::<Config>("[[source]]\ndevice = \"a\"\npin = 1\n").is_err());
    }

    #[test]
    fn generic_reference_offset() {
        let config = parse(&format!("{MINIMAL}\n[reference]\ntype = \"generic\"\nutc-offset = 36\n"));
        assert_eq!(config.reference, ReferenceConfig::Generic { utc_offset: 36 });

        let snake = format!("{MINIMAL}\n[reference]\ntype = \"generic\"\nutc_offset = 36\n");
        assert!(toml::de::from_str::<Config>(&snake).is_err());

        let extra = format!("{MINIMAL}\n[reference]\ntype = \"phc\"\ndevice = \"a\"\nutc-offset = 1\n");
        assert!(toml::de::from_str::<Config>(&extra).is_err());
    }

    #[test]
    fn bus_clock() {
        let config = parse(&format!("{MINIMAL}\n[bus]\nreference = \"/dev/ptp0\"\n"));
        assert!(config.check());
        assert_eq!(
            config.bus,
            Some(BusConfig {
                spi_device: "/dev/spidev0.1".into(),
                spi_speed_hz: 1_000_000,
                reference: "/dev/ptp0".into(),
                ratio: RatioSyncConfig::default(),
            })
        );

        let config = parse(&format!(
            "{MINIMAL}\n[bus]\nspi-device = \"/dev/spidev1.0\"\nreference = \"eth0\"\n\n[bus.ratio]\nmax-offset = 5000\ntick-ns = 16\nsync-period-ms = 250\n"
        ));
        let bus = config.bus.unwrap();
        assert_eq!(bus.spi_device, Path::new("/dev/spidev1.0"));
        assert_eq!(bus.ratio.max_offset, 5000);
        assert_eq!(bus.ratio.tick_ns.get(), 16);
        assert_eq!(bus.ratio.sync_period(), std::time::Duration::from_millis(250));
    }

    #[test]
    fn zero_tick_is_rejected() {
        let zero = format!("{MINIMAL}\n[bus]\nreference = \"a\"\n\n[bus.ratio]\ntick-ns = 0\n");
        assert!(toml::de::from_str::<Config>(&zero).is_err());

        let missing_reference = format!("{MINIMAL}\n[bus]\nspi-device = \"/dev/spidev0.0\"\n");
        assert!(toml::de::from_str::<Config>(&missing_reference).is_err());

        let mut config = parse(&format!("{MINIMAL}\n[bus]\nreference = \"a\"\n"));
        if let Some(bus) = &mut config.bus {
            bus.ratio.sync_period_ms = 0;
        }
        assert!(!config.check());
    }

    #[test]
    fn check_finds_problems() {
        let mut config = parse(MINIMAL);
        config.sources.push(SourceConfig::new("/dev/ptp0"));
        assert!(!config.check());

        let mut config = parse(MINIMAL);
        config.sources[0].pulse_width = 0;
        assert!(!config.check());

        let mut config = parse(MINIMAL);
        config.loglevel = "loud".into();
        assert!(!config.check());

        let config = parse("loglevel = \"warn\"\n");
        assert!(!config.check());
    }

    #[tokio::test]
    async fn missing_file() {
        assert!(matches!(
            Config::from_file("/this/does/not/exist.toml").await,
            Err(ConfigError::Io(_))
        ));
    }
}
