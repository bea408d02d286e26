//! Structures and requests of the PTP hardware clock character device, see
//! `include/uapi/linux/ptp_clock.h`

use std::os::fd::RawFd;

const PTP_CLK_MAGIC: u8 = b'=';

nix::ioctl_read!(
    /// `PTP_CLOCK_GETCAPS`
    clock_getcaps,
    PTP_CLK_MAGIC,
    1,
    PtpClockCaps
);

nix::ioctl_write_ptr!(
    /// `PTP_EXTTS_REQUEST2`
    extts_request2,
    PTP_CLK_MAGIC,
    11,
    PtpExttsRequest
);

nix::ioctl_write_ptr!(
    /// `PTP_PIN_SETFUNC2`
    pin_setfunc2,
    PTP_CLK_MAGIC,
    16,
    PtpPinDesc
);

pub const PTP_ENABLE_FEATURE: u32 = 1 << 0;
pub const PTP_RISING_EDGE: u32 = 1 << 1;
pub const PTP_FALLING_EDGE: u32 = 1 << 2;

/// Pin function: external timestamp input
pub const PTP_PF_EXTTS: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpClockTime {
    pub sec: i64,
    pub nsec: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpClockCaps {
    /// Maximum frequency adjustment in parts per billion
    pub max_adj: i32,
    pub n_alarm: i32,
    pub n_ext_ts: i32,
    pub n_per_out: i32,
    pub pps: i32,
    pub n_pins: i32,
    pub cross_timestamping: i32,
    pub adjust_phase: i32,
    pub rsv: [i32; 12],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpExttsRequest {
    pub index: u32,
    pub flags: u32,
    pub rsv: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpExttsEvent {
    pub t: PtpClockTime,
    pub index: u32,
    pub flags: u32,
    pub rsv: [u32; 2],
}

impl PtpExttsEvent {
    /// Decode an event as read from the clock device
    pub fn from_bytes(buf: [u8; 32]) -> Self {
        let word = |at: usize| u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut sec = [0; 8];
        sec.copy_from_slice(&buf[..8]);

        Self {
            t: PtpClockTime {
                sec: i64::from_ne_bytes(sec),
                nsec: word(8),
                reserved: word(12),
            },
            index: word(16),
            flags: word(20),
            rsv: [word(24), word(28)],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PtpPinDesc {
    pub name: [libc::c_char; 64],
    pub index: u32,
    pub func: u32,
    pub chan: u32,
    pub rsv: [u32; 5],
}

impl Default for PtpPinDesc {
    fn default() -> Self {
        Self {
            name: [0; 64],
            index: 0,
            func: 0,
            chan: 0,
            rsv: [0; 5],
        }
    }
}

/// The dynamic posix clock id of an open clock device
pub(crate) fn fd_to_clockid(fd: RawFd) -> libc::clockid_t {
    ((!(fd as libc::clockid_t)) << 3) | 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_sizes() {
        assert_eq!(std::mem::size_of::<PtpClockCaps>(), 80);
        assert_eq!(std::mem::size_of::<PtpExttsRequest>(), 16);
        assert_eq!(std::mem::size_of::<PtpExttsEvent>(), 32);
        assert_eq!(std::mem::size_of::<PtpPinDesc>(), 96);
    }

    #[test]
    fn request_numbers() {
        use std::mem::size_of;

        assert_eq!(
            nix::request_code_read!(PTP_CLK_MAGIC, 1, size_of::<PtpClockCaps>()) as u32,
            0x8050_3d01
        );
        assert_eq!(
            nix::request_code_write!(PTP_CLK_MAGIC, 11, size_of::<PtpExttsRequest>()) as u32,
            0x4010_3d0b
        );
        assert_eq!(
            nix::request_code_write!(PTP_CLK_MAGIC, 16, size_of::<PtpPinDesc>()) as u32,
            0x4060_3d10
        );
    }

    #[test]
    fn event_layout() {
        let mut buf = [0u8; 32];
        buf[..8].copy_from_slice(&1_700_000_000i64.to_ne_bytes());
        buf[8..12].copy_from_slice(&999_999_999u32.to_ne_bytes());
        buf[16..20].copy_from_slice(&2u32.to_ne_bytes());
        buf[20..24].copy_from_slice(&PTP_RISING_EDGE.to_ne_bytes());

        let event = PtpExttsEvent::from_bytes(buf);
        assert_eq!(event.t.sec, 1_700_000_000);
        assert_eq!(event.t.nsec, 999_999_999);
        assert_eq!(event.index, 2);
        assert_eq!(event.flags, PTP_RISING_EDGE);
    }

    #[test]
    fn dynamic_clock_ids() {
        assert_eq!(fd_to_clockid(3), -29);
        assert_eq!(fd_to_clockid(0), -5);
    }
}
