use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{trace, warn};

use crate::tcp::segment::Segment;
use crate::{Error, RECV_BUF};

/// Waits until the socket has a datagram to read, or the timeout passes.
///
/// Receive loops poll instead of blocking outright so they can re-check
/// protocol state between datagrams and so a closed socket surfaces as an
/// error instead of a hang.
pub fn poll_readable(sock: &UdpSocket, timeout: Duration) -> Result<bool, Error> {
    let mut pfd = [PollFd::new(sock.as_raw_fd(), PollFlags::POLLIN)];
    match poll(&mut pfd[..], timeout.as_millis() as i32) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(Error::Io(io::Error::from(errno))),
    }
}

/// Encodes and transmits one segment.
pub fn send_segment(sock: &UdpSocket, segment: &Segment, dst: SocketAddr) -> Result<(), Error> {
    sock.send_to(&segment.encode(), dst)?;
    trace!(
        seq = segment.header.seq_num,
        ack = segment.header.ack_num,
        len = segment.payload.len(),
        fin = segment.header.flags.fin(),
        "sent segment"
    );
    Ok(())
}

/// Receives one datagram and decodes it. Malformed datagrams and checksum
/// mismatches yield `None`: both are silently dropped and left for the
/// peer's retransmission machinery to repair.
pub fn recv_segment(sock: &UdpSocket) -> Result<Option<(Segment, SocketAddr)>, Error> {
    let mut buf = [0u8; RECV_BUF];
    let (n, from) = sock.recv_from(&mut buf)?;

    let segment = match Segment::decode(&buf[..n]) {
        Ok(segment) => segment,
        Err(_) => {
            warn!(len = n, %from, "dropping malformed datagram");
            return Ok(None);
        }
    };

    if !segment.verify() {
        warn!(
            seq = segment.header.seq_num,
            %from,
            "dropping segment with bad checksum"
        );
        return Ok(None);
    }

    trace!(
        seq = segment.header.seq_num,
        ack = segment.header.ack_num,
        len = segment.payload.len(),
        "received segment"
    );
    Ok(Some((segment, from)))
}
