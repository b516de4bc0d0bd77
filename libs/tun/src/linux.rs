//! Linux TUN device backed by `/dev/net/tun`.

use crate::Tun;
use crate::ioctl;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

/// Handle to an attached TUN interface.
///
/// The interface itself is created and routed by whoever configures the
/// host; attaching only requires the name. Must be created inside a tokio
/// runtime.
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    pub fn open(name: &str) -> io::Result<Self> {
        let raw = match unsafe { libc::open(c"/dev/net/tun".as_ptr().cast(), libc::O_RDWR) } {
            -1 => return Err(io::Error::last_os_error()),
            fd => fd,
        };

        // Own the fd before anything can fail so it is closed on error.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = ioctl::Ifreq::new(name)?;
        req.payload.flags = ioctl::IFF_TUN | ioctl::IFF_NO_PI;

        unsafe { ioctl::exec(fd.as_raw_fd(), ioctl::TUNSETIFF, &mut req)? };

        set_non_blocking(fd.as_raw_fd())?;

        tracing::debug!(%name, "Attached to TUN device");

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: name.to_owned(),
        })
    }

    pub fn set_mtu(&self, mtu: u32) -> io::Result<()> {
        let socket = control_socket()?;

        let mut req = ioctl::Ifreq::new(&self.name)?;
        req.payload.mtu = mtu as libc::c_int;

        unsafe { ioctl::exec(socket.as_raw_fd(), ioctl::SIOCSIFMTU, &mut req) }
    }

    pub fn set_up(&self, up: bool) -> io::Result<()> {
        let socket = control_socket()?;

        let mut req = ioctl::Ifreq::new(&self.name)?;
        unsafe { ioctl::exec(socket.as_raw_fd(), ioctl::SIOCGIFFLAGS, &mut req)? };

        let flags = unsafe { req.payload.flags };
        let up_flags = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;

        req.payload.flags = if up { flags | up_flags } else { flags & !up_flags };

        unsafe { ioctl::exec(socket.as_raw_fd(), ioctl::SIOCSIFFLAGS, &mut req) }
    }
}

#[async_trait::async_trait]
impl Tun for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|inner| read(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|inner| write(inner.get_ref().as_raw_fd(), packet)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn control_socket() -> io::Result<OwnedFd> {
    match unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) } {
        -1 => Err(io::Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
    }
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    match unsafe { libc::fcntl(fd, libc::F_GETFL) } {
        -1 => Err(io::Error::last_os_error()),
        flags => match unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        },
    }
}

/// Read one datagram from the given file descriptor.
fn read(fd: RawFd, dst: &mut [u8]) -> io::Result<usize> {
    // Safety: the fd lives as long as the device.
    match unsafe { libc::read(fd, dst.as_mut_ptr() as _, dst.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Write one datagram to the given file descriptor.
fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // Safety: the fd lives as long as the device.
    match unsafe { libc::write(fd, buf.as_ptr() as _, buf.len() as _) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
