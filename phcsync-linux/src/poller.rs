//! Waiting for external timestamp events on several clocks at once

use std::{
    io,
    os::fd::{AsFd, OwnedFd},
    sync::Arc,
    time::Duration,
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout},
};
use phcsync::sync::EventPoller;

use crate::clock::{LinuxPhc, PhcError};

/// Polls the clock devices of all sources, in source order
#[derive(Debug, Clone)]
pub struct LinuxPoller {
    fds: Arc<Vec<OwnedFd>>,
}

impl LinuxPoller {
    /// Create a poller for the devices of the sources of an orchestrator
    pub fn new<'a>(
        devices: impl IntoIterator<Item = Option<&'a LinuxPhc>>,
    ) -> Result<Self, PhcError> {
        let fds = devices
            .into_iter()
            .map(|device| match device {
                Some(device) => Ok(device.try_clone_fd()?),
                None => Err(PhcError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "source without a clock",
                ))),
            })
            .collect::<Result<_, PhcError>>()?;

        Ok(Self::from_fds(fds))
    }

    pub fn from_fds(fds: Vec<OwnedFd>) -> Self {
        Self { fds: Arc::new(fds) }
    }
}

impl EventPoller for LinuxPoller {
    type Error = PhcError;

    async fn wait(&mut self, timeout: Duration) -> Result<Vec<usize>, PhcError> {
        let fds = self.fds.clone();
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);

        let ready = tokio::task::spawn_blocking(move || poll_fds(&fds, timeout))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        Ok(ready)
    }
}

/// Block until one of `fds` is readable, returning the indices of all readable
/// descriptors. Nothing is returned on timeout or when interrupted by a
/// signal.
fn poll_fds(fds: &[OwnedFd], timeout: PollTimeout) -> Result<Vec<usize>, PhcError> {
    let events = PollFlags::POLLIN | PollFlags::POLLPRI;
    let mut pollfds: Vec<PollFd> = fds
        .iter()
        .map(|fd| PollFd::new(fd.as_fd(), events))
        .collect();

    match nix::poll::poll(&mut pollfds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    Ok(pollfds
        .iter()
        .enumerate()
        .filter(|(_, pollfd)| pollfd.revents().is_some_and(|r| r.intersects(events)))
        .map(|(index, _)| index)
        .collect())
}

#[cfg(test)]
mod tests {
    use nix::unistd::{pipe, write};

    use super::*;

    fn write_byte(fd: &OwnedFd) {
        assert_eq!(write(fd, b"x").unwrap(), 1);
    }

    #[test]
    fn reports_readable_descriptors() {
        let (read_a, _write_a) = pipe().unwrap();
        let (read_b, write_b) = pipe().unwrap();
        let (read_c, write_c) = pipe().unwrap();

        write_byte(&write_b);
        write_byte(&write_c);

        let fds = vec![read_a, read_b, read_c];
        assert_eq!(poll_fds(&fds, PollTimeout::ZERO).unwrap(), vec![1, 2]);
    }

    #[test]
    fn timeout_is_empty() {
        let (read, _write) = pipe().unwrap();
        assert!(poll_fds(&[read], PollTimeout::from(10u8))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn waits_in_the_background() {
        let (read, write) = pipe().unwrap();
        let mut poller = LinuxPoller::from_fds(vec![read]);

        assert!(poller
            .wait(Duration::from_millis(1))
            .await
            .unwrap()
            .is_empty());

        write_byte(&write);
        assert_eq!(
            poller.wait(Duration::from_millis(1000)).await.unwrap(),
            vec![0]
        );
    }
}
