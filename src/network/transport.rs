//! Thin OS transport wrappers
//!
//! Non-blocking TCP listener/stream setup, read/write outcomes, and the
//! `poll(2)` descriptor set the node reactor blocks on.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::IpVersion;

/// Result of a single non-blocking read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes transferred (always > 0)
    Transferred(usize),
    /// The operation would block
    WouldBlock,
    /// The remote end closed the stream
    Closed,
}

/// Open a non-blocking listener for the given IP version
pub fn open_listener(ip: IpVersion, bind_address: Option<&str>, port: u16) -> io::Result<TcpListener> {
    let addr = match bind_address {
        Some(host) => {
            let ip: IpAddr = host.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid bind address: {}", host),
                )
            })?;
            SocketAddr::new(ip, port)
        }
        None => match ip {
            IpVersion::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            IpVersion::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        },
    };

    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Prepare a freshly accepted or connected stream for the reactor
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(())
}

/// Connect to a remote node; the returned stream is non-blocking
pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    configure_stream(&stream)?;
    Ok(stream)
}

/// Accept one pending connection, if any
pub fn accept(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    match listener.accept() {
        Ok(pair) => Ok(Some(pair)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn read(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<IoOutcome> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(IoOutcome::Closed),
            Ok(n) => return Ok(IoOutcome::Transferred(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

pub fn write(stream: &mut TcpStream, buf: &[u8]) -> io::Result<IoOutcome> {
    loop {
        match stream.write(buf) {
            Ok(0) => return Ok(IoOutcome::Closed),
            Ok(n) => return Ok(IoOutcome::Transferred(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Readiness reported for one descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Hang-up, error, or invalid descriptor
    pub failed: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable && !self.failed
    }
}

/// Descriptor set for `poll(2)`
#[derive(Default)]
pub struct DescriptorSet {
    fds: Vec<libc::pollfd>,
}

impl fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.fds.iter().map(|p| (p.fd, p.events, p.revents)))
            .finish()
    }
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Register a descriptor; returns its slot in the set
    pub fn register(&mut self, fd: RawFd, writable: bool) -> usize {
        let mut events = libc::POLLIN;
        if writable {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.fds.len() - 1
    }

    pub fn readiness(&self, slot: usize) -> Readiness {
        let revents = self.fds.get(slot).map_or(0, |p| p.revents);
        Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            failed: revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }

    /// Block until a descriptor is ready or `timeout` elapses.
    ///
    /// Returns the number of ready descriptors; an interrupted wait reports 0.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        for entry in &mut self.fds {
            entry.revents = 0;
        }

        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // Round sub-millisecond timeouts up so they do not degrade to a busy poll.
        let millis = if millis == 0 && !timeout.is_zero() { 1 } else { millis };

        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd for
        // the duration of the call and its length is passed alongside it.
        let ready = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                millis,
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(ready as usize)
    }
}
