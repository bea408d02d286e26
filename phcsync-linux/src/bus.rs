//! Access to the PTP clock of an NXP SJA1105 switch over spidev
//!
//! Every SPI frame starts with a 32 bit header holding the direction, the
//! number of words to read and the register address. Registers are 32 bit
//! words sent most significant byte first; the 64 bit clock value has its low
//! word at the lower address.

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::Path,
};

use phcsync::{ratio::RatioRegister, sync::ratio::ManagementBus};
use thiserror::Error;

/// PTP control register
const PTP_CONTROL: u32 = 0x17;
/// PTP clock value, two words
const PTP_CLK_VAL: u32 = 0x18;
/// PTP clock rate register
const PTP_CLK_RATE: u32 = 0x1a;

const CONTROL_VALID: u32 = 1 << 31;
/// Writes to the clock value register are added to the clock instead of
/// replacing it
const CONTROL_CLK_ADD: u32 = 1 << 0;

const HEADER_WRITE: u32 = 1 << 31;
const HEADER_READ_COUNT_SHIFT: u32 = 25;
const HEADER_ADDR_SHIFT: u32 = 4;
const HEADER_ADDR_MASK: u32 = 0x1f_ffff;
const MAX_READ_WORDS: usize = 64;

/// Operating mode of the bus, `SPI_CPHA`
const SPI_MODE: u8 = 0x01;
const SPI_BITS_PER_WORD: u8 = 8;

const SPI_IOC_MAGIC: u8 = b'k';

nix::ioctl_write_buf!(
    /// `SPI_IOC_MESSAGE(N)`
    spi_message,
    SPI_IOC_MAGIC,
    0,
    SpiIocTransfer
);
nix::ioctl_write_ptr!(
    /// `SPI_IOC_WR_MODE`
    spi_write_mode,
    SPI_IOC_MAGIC,
    1,
    u8
);
nix::ioctl_write_ptr!(
    /// `SPI_IOC_WR_BITS_PER_WORD`
    spi_write_bits_per_word,
    SPI_IOC_MAGIC,
    3,
    u8
);
nix::ioctl_write_ptr!(
    /// `SPI_IOC_WR_MAX_SPEED_HZ`
    spi_write_max_speed_hz,
    SPI_IOC_MAGIC,
    4,
    u32
);

/// `struct spi_ioc_transfer` of `include/uapi/linux/spi/spidev.h`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("could not open spi device {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("spi transfer failed: {0}")]
    Transfer(#[from] io::Error),
    #[error("can not read {0} words in one transfer")]
    ReadTooLong(usize),
}

impl From<nix::errno::Errno> for BusError {
    fn from(errno: nix::errno::Errno) -> Self {
        BusError::Transfer(errno.into())
    }
}

/// A full duplex transfer on a SPI bus
pub trait SpiTransfer {
    /// Clock out `tx` while clocking `rx.len()` bytes in. Both are the same
    /// length.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError>;
}

/// A spidev character device, `/dev/spidevB.C`
#[derive(Debug)]
pub struct Spidev {
    file: File,
    speed_hz: u32,
}

impl Spidev {
    /// Open and configure the SPI device at `path`
    pub fn open(path: impl AsRef<Path>, speed_hz: u32) -> Result<Self, BusError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| BusError::Open {
                name: path.display().to_string(),
                source,
            })?;

        let fd = file.as_raw_fd();
        // SAFETY: each request reads a value of the given type from a valid
        // reference, on an open spidev file
        unsafe {
            spi_write_mode(fd, &SPI_MODE)?;
            spi_write_bits_per_word(fd, &SPI_BITS_PER_WORD)?;
            spi_write_max_speed_hz(fd, &speed_hz)?;
        }

        log::debug!("opened {} at {speed_hz}Hz", path.display());

        Ok(Self { file, speed_hz })
    }
}

impl SpiTransfer for Spidev {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len().min(rx.len()) as u32,
            speed_hz: self.speed_hz,
            bits_per_word: SPI_BITS_PER_WORD,
            ..Default::default()
        };

        // SAFETY: both buffers outlive the call and are at least len bytes
        unsafe { spi_message(self.file.as_raw_fd(), &[transfer])? };
        Ok(())
    }
}

fn header(write: bool, address: u32, read_words: usize) -> [u8; 4] {
    let mut header = (address & HEADER_ADDR_MASK) << HEADER_ADDR_SHIFT;
    if write {
        header |= HEADER_WRITE;
    } else {
        // a count of zero reads 64 words
        header |= ((read_words % MAX_READ_WORDS) as u32) << HEADER_READ_COUNT_SHIFT;
    }
    header.to_be_bytes()
}

/// The PTP clock of an SJA1105 (E/T) switch
#[derive(Debug)]
pub struct Sja1105<T> {
    spi: T,
}

impl<T: SpiTransfer> Sja1105<T> {
    pub fn new(spi: T) -> Self {
        Self { spi }
    }

    pub fn spi(&self) -> &T {
        &self.spi
    }

    fn write_words(&mut self, address: u32, words: &[u32]) -> Result<(), BusError> {
        let mut tx = header(true, address, 0).to_vec();
        tx.extend(words.iter().flat_map(|word| word.to_be_bytes()));
        let mut rx = vec![0; tx.len()];
        self.spi.transfer(&tx, &mut rx)
    }

    fn read_words<const N: usize>(&mut self, address: u32) -> Result<[u32; N], BusError> {
        if N == 0 || N > MAX_READ_WORDS {
            return Err(BusError::ReadTooLong(N));
        }

        let mut tx = vec![0; 4 + 4 * N];
        tx[..4].copy_from_slice(&header(false, address, N));
        let mut rx = vec![0; tx.len()];
        self.spi.transfer(&tx, &mut rx)?;

        let mut words = [0; N];
        for (word, bytes) in words.iter_mut().zip(rx[4..].chunks_exact(4)) {
            *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(words)
    }

    fn write_clock(&mut self, control: u32, ticks: u64) -> Result<(), BusError> {
        self.write_words(PTP_CONTROL, &[CONTROL_VALID | control])?;
        self.write_words(PTP_CLK_VAL, &[ticks as u32, (ticks >> 32) as u32])
    }
}

impl<T: SpiTransfer> ManagementBus for Sja1105<T> {
    type Error = BusError;

    fn write_ratio(&mut self, ratio: RatioRegister) -> Result<(), BusError> {
        self.write_words(PTP_CLK_RATE, &[ratio.bits()])
    }

    fn read_counter(&mut self) -> Result<u64, BusError> {
        let [low, high] = self.read_words::<2>(PTP_CLK_VAL)?;
        Ok(u64::from(high) << 32 | u64::from(low))
    }

    fn set_absolute_time(&mut self, ticks: u64) -> Result<(), BusError> {
        self.write_clock(0, ticks)
    }

    fn add_time(&mut self, ticks: u64) -> Result<(), BusError> {
        self.write_clock(CONTROL_CLK_ADD, ticks)
    }
}
