// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;

/// Outcome of waiting on a capture node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A filled buffer can be dequeued.
    Readable,
    /// The node reported `POLLERR`.
    ///
    /// V4L2 signals this when the queue is not streaming or has no buffer queued, so it is not
    /// necessarily fatal.
    Error,
}

/// Wait without timeout until `fd` becomes readable or signals an error condition.
///
/// Interrupted waits are restarted. An invalid descriptor (`POLLNVAL`) or a hung up device
/// (`POLLHUP`) is a hard failure.
pub fn wait_readable<F: AsFd>(fd: &F) -> io::Result<Readiness> {
    loop {
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN | PollFlags::POLLRDNORM)];
        match poll(&mut fds, -1) {
            Ok(_) => (),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(Errno::EBADF.into());
        }
        if revents.contains(PollFlags::POLLHUP) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "capture device hung up",
            ));
        }
        if revents.contains(PollFlags::POLLERR) {
            return Ok(Readiness::Error);
        }
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLRDNORM) {
            return Ok(Readiness::Readable);
        }
    }
}
