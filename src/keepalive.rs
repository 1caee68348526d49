use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

use crate::error::Status;
use crate::platform::posix::Fd;

const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const PAYLOAD: &[u8] = b"tsp keepalive";

/// Keeps the tunnel binding alive for the rest of the tunnel's life.
pub trait Keepalive {
    fn run(&self, local: Ipv6Addr, remote: Ipv6Addr, interval: Duration) -> Status;
}

impl<T: Keepalive + ?Sized> Keepalive for &T {
    fn run(&self, local: Ipv6Addr, remote: Ipv6Addr, interval: Duration) -> Status {
        (**self).run(local, remote, interval)
    }
}

/// ICMPv6 echo keepalive over a raw socket.
///
/// Gives up with [`Status::KeepaliveTimeout`] after `max_missed` requests
/// in a row went unanswered, and returns [`Status::NoError`] once stopped.
#[derive(Clone, Debug)]
pub struct IcmpKeepalive {
    stop: Arc<AtomicBool>,
    max_missed: u32,
    identifier: u16,
}

impl Default for IcmpKeepalive {
    fn default() -> Self {
        IcmpKeepalive {
            stop: Arc::new(AtomicBool::new(false)),
            max_missed: 3,
            identifier: std::process::id() as u16,
        }
    }
}

impl IcmpKeepalive {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn max_missed(mut self, max_missed: u32) -> Self {
        self.max_missed = max_missed.max(1);
        self
    }
    /// Raise the returned flag to end [`Keepalive::run`] after the current interval.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn run_loop(&self, local: Ipv6Addr, remote: Ipv6Addr, interval: Duration) -> io::Result<Status> {
        let socket = Fd::icmpv6()?;
        socket.bind_v6(local)?;
        let mut missed = 0;
        let mut seq: u16 = 0;
        let mut buf = [0u8; 1500];
        while !self.stopped() {
            seq = seq.wrapping_add(1);
            let sent_at = Instant::now();
            socket.send_to_v6(&echo_request(self.identifier, seq), remote)?;
            log::trace!("keepalive echo request seq={seq} to {remote}");

            let deadline = sent_at
                .checked_add(interval)
                .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
            let mut answered = false;
            while let Some(left) = deadline.checked_duration_since(Instant::now()) {
                socket.set_recv_timeout(left)?;
                match socket.read(&mut buf) {
                    Ok(len) => {
                        if is_echo_reply(&buf[..len], self.identifier, seq) {
                            answered = true;
                            break;
                        }
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        break
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            if answered {
                missed = 0;
                if let Some(rest) = deadline.checked_duration_since(Instant::now()) {
                    std::thread::sleep(rest);
                }
            } else {
                missed += 1;
                log::warn!("keepalive to {remote} unanswered ({missed}/{})", self.max_missed);
                if missed >= self.max_missed {
                    log::error!("keepalive timeout, {remote} stopped answering");
                    return Ok(Status::KeepaliveTimeout);
                }
            }
        }
        Ok(Status::NoError)
    }
}

impl Keepalive for IcmpKeepalive {
    fn run(&self, local: Ipv6Addr, remote: Ipv6Addr, interval: Duration) -> Status {
        if self.stopped() {
            return Status::NoError;
        }
        if interval.is_zero() || Instant::now().checked_add(interval).is_none() {
            log::error!("keepalive interval {}s out of range", interval.as_secs());
            return Status::KeepaliveError;
        }
        log::info!(
            "starting keepalive from {local} to {remote} every {}s",
            interval.as_secs()
        );
        match self.run_loop(local, remote, interval) {
            Ok(status) => status,
            Err(e) => {
                log::error!("keepalive failed: {e}");
                Status::KeepaliveError
            }
        }
    }
}

/// ICMPv6 echo request; the kernel fills in the checksum on raw ICMPv6 sockets.
pub(crate) fn echo_request(identifier: u16, seq: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + PAYLOAD.len());
    buf.put_u8(ICMPV6_ECHO_REQUEST);
    buf.put_u8(0);
    buf.put_u16(0);
    buf.put_u16(identifier);
    buf.put_u16(seq);
    buf.put_slice(PAYLOAD);
    buf
}

pub(crate) fn is_echo_reply(buf: &[u8], identifier: u16, seq: u16) -> bool {
    buf.len() >= 8
        && buf[0] == ICMPV6_ECHO_REPLY
        && BigEndian::read_u16(&buf[4..6]) == identifier
        && BigEndian::read_u16(&buf[6..8]) == seq
}
