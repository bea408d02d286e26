//! Implementation of the clock abstractions for PTP hardware clocks on linux

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::fd::{AsFd, AsRawFd, OwnedFd},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use clock_steering::{unix::UnixClock, Clock, TimeOffset};
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout},
};
use phcsync::{
    clock::{ClockDevice, ClockOpener},
    extts::{EdgePolarity, ExtTsDevice, ExtTsEvent},
    reference::SystemClock,
    time::{Duration, Time},
};
use thiserror::Error;

use self::ptp::{PtpClockCaps, PtpExttsEvent, PtpExttsRequest, PtpPinDesc};

pub(crate) mod ptp;

/// The kernel reports frequency offsets in ppm with a 16 bit fractional part
const SCALED_PPM_PER_PPB: f64 = 65.536;

#[derive(Error, Debug)]
pub enum PhcError {
    #[error("could not open clock {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a PTP hardware clock")]
    NotAClock(String),
    #[error("clock adjustment failed: {0}")]
    Steering(<UnixClock as Clock>::Error),
    #[error("clock device error: {0}")]
    Io(#[from] io::Error),
}

impl From<Errno> for PhcError {
    fn from(errno: Errno) -> Self {
        PhcError::Io(errno.into())
    }
}

/// A PTP hardware clock, `/dev/ptpN`
///
/// Reading and steering the clock goes through [`UnixClock`], the character
/// device requests for capabilities, pins and external timestamps through
/// `file`.
pub struct LinuxPhc {
    file: File,
    clock: UnixClock,
}

impl std::fmt::Debug for LinuxPhc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxPhc").field("file", &self.file).finish()
    }
}

impl LinuxPhc {
    /// Open the clock device at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PhcError> {
        let path = path.as_ref();
        let open_error = |source| PhcError::Open {
            name: path.display().to_string(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(open_error)?;
        let clock = UnixClock::open(path).map_err(open_error)?;

        Ok(Self { file, clock })
    }

    /// A second handle on the clock device, for waiting on its events
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        Ok(self.file.try_clone()?.into())
    }

    fn caps(&self) -> Result<PtpClockCaps, PhcError> {
        let mut caps = PtpClockCaps::default();
        // SAFETY: the request fills a ptp_clock_caps on an open clock device
        unsafe { ptp::clock_getcaps(self.file.as_raw_fd(), &mut caps)? };
        Ok(caps)
    }

    fn extts_request(&mut self, channel: u32, flags: u32) -> Result<(), PhcError> {
        let request = PtpExttsRequest {
            index: channel,
            flags,
            ..Default::default()
        };
        // SAFETY: the request reads a ptp_extts_request
        unsafe { ptp::extts_request2(self.file.as_raw_fd(), &request)? };
        Ok(())
    }

    fn has_pending_event(&self) -> Result<bool, PhcError> {
        let mut fds = [PollFd::new(
            self.file.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLPRI,
        )];
        Ok(nix::poll::poll(&mut fds, PollTimeout::ZERO)? > 0)
    }
}

impl ClockDevice for LinuxPhc {
    type Error = PhcError;

    fn now(&self) -> Result<Time, Self::Error> {
        let now = self.clock.now().map_err(PhcError::Steering)?;
        Ok(Time::from_secs_nanos(now.seconds as i64, now.nanos))
    }

    fn frequency(&self) -> Result<f64, Self::Error> {
        // steering only writes the frequency, so read it back from the kernel
        // SAFETY: timex is a plain C struct for which all zeroes is a valid
        // value, and modes 0 only reads
        let mut timex: libc::timex = unsafe { std::mem::zeroed() };
        let clock = ptp::fd_to_clockid(self.file.as_raw_fd());
        // SAFETY: timex is a valid, exclusive reference
        Errno::result(unsafe { libc::clock_adjtime(clock, &mut timex) })?;
        Ok(timex.freq as f64 / SCALED_PPM_PER_PPB)
    }

    fn set_frequency(&mut self, ppb: f64) -> Result<(), Self::Error> {
        self.clock
            .set_frequency(ppb / 1_000.0)
            .map_err(PhcError::Steering)?;
        Ok(())
    }

    fn step_clock(&mut self, offset: Duration) -> Result<(), Self::Error> {
        let nanos = offset.nanos();
        let offset = TimeOffset {
            seconds: nanos.div_euclid(1_000_000_000) as _,
            nanos: nanos.rem_euclid(1_000_000_000) as _,
        };
        self.clock.step_clock(offset).map_err(PhcError::Steering)?;
        Ok(())
    }

    fn max_frequency(&self) -> Result<f64, Self::Error> {
        Ok(self.caps()?.max_adj as f64)
    }
}

impl ExtTsDevice for LinuxPhc {
    fn pin_count(&self) -> Result<u32, Self::Error> {
        Ok(self.caps()?.n_pins.max(0) as u32)
    }

    fn set_pin_function(&mut self, pin: u32, channel: u32) -> Result<(), Self::Error> {
        let desc = PtpPinDesc {
            index: pin,
            func: ptp::PTP_PF_EXTTS,
            chan: channel,
            ..Default::default()
        };
        // SAFETY: the request reads a ptp_pin_desc
        unsafe { ptp::pin_setfunc2(self.file.as_raw_fd(), &desc)? };
        Ok(())
    }

    fn enable_extts(&mut self, channel: u32, polarity: EdgePolarity) -> Result<(), Self::Error> {
        let edges = match polarity {
            EdgePolarity::Rising => ptp::PTP_RISING_EDGE,
            EdgePolarity::Falling => ptp::PTP_FALLING_EDGE,
            EdgePolarity::Both => ptp::PTP_RISING_EDGE | ptp::PTP_FALLING_EDGE,
        };
        self.extts_request(channel, ptp::PTP_ENABLE_FEATURE | edges)
    }

    fn disable_extts(&mut self, channel: u32) -> Result<(), Self::Error> {
        self.extts_request(channel, 0)
    }

    fn read_extts(&mut self) -> Result<Option<ExtTsEvent>, Self::Error> {
        if !self.has_pending_event()? {
            return Ok(None);
        }

        let mut buf = [0u8; 32];
        self.file.read_exact(&mut buf)?;
        let event = PtpExttsEvent::from_bytes(buf);

        Ok(Some(ExtTsEvent {
            channel: event.index,
            time: Time::from_secs_nanos(event.t.sec, event.t.nsec),
        }))
    }
}

/// Opens clocks by device path, or by the name of a network interface with a
/// hardware clock
#[derive(Debug, Clone)]
pub struct LinuxOpener {
    sys_root: PathBuf,
}

impl Default for LinuxOpener {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
        }
    }
}

impl LinuxOpener {
    /// Find the device path and hardware index of the clock called `name`
    pub fn resolve(&self, name: &str) -> Result<(PathBuf, u32), PhcError> {
        if name.starts_with('/') {
            // follow symlinks such as /dev/ptp_kvm to the real device
            let path = std::fs::canonicalize(name).map_err(|source| PhcError::Open {
                name: name.into(),
                source,
            })?;
            let index = phc_index(&path).ok_or_else(|| PhcError::NotAClock(name.into()))?;
            return Ok((path, index));
        }

        let dir = self.sys_root.join("class/net").join(name).join("device/ptp");
        let entries = std::fs::read_dir(&dir).map_err(|_| PhcError::NotAClock(name.into()))?;
        for entry in entries {
            let path = PathBuf::from("/dev").join(entry?.file_name());
            if let Some(index) = phc_index(&path) {
                log::debug!("interface {name} has clock {}", path.display());
                return Ok((path, index));
            }
        }

        Err(PhcError::NotAClock(name.into()))
    }
}

impl ClockOpener for LinuxOpener {
    type Device = LinuxPhc;

    fn open(&mut self, name: &str) -> Result<(LinuxPhc, u32), PhcError> {
        let (path, index) = self.resolve(name)?;
        Ok((LinuxPhc::open(path)?, index))
    }
}

/// The index N of `/dev/ptpN`
fn phc_index(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("ptp")?
        .parse()
        .ok()
}

/// The realtime system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRealtime;

impl SystemClock for SystemRealtime {
    fn now(&self) -> Time {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => Time::from_secs_nanos(since.as_secs() as i64, since.subsec_nanos()),
            Err(before) => {
                Time::EPOCH - Duration::from_nanos(before.duration().as_nanos() as i64)
            }
        }
    }
}
