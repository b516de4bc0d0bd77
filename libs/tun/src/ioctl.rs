//! Just enough ioctl plumbing for TUN interfaces.

use std::io;
use std::os::fd::RawFd;

pub(crate) const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
pub(crate) const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
pub(crate) const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
pub(crate) const SIOCSIFMTU: libc::c_ulong = 0x8922;

pub(crate) const IFF_TUN: libc::c_short = 0x0001;
pub(crate) const IFF_NO_PI: libc::c_short = 0x1000;

/// `struct ifreq` with the payload variants we touch.
#[repr(C)]
pub(crate) struct Ifreq {
    pub name: [libc::c_char; libc::IFNAMSIZ],
    pub payload: IfreqPayload,
}

#[repr(C)]
pub(crate) union IfreqPayload {
    pub flags: libc::c_short,
    pub mtu: libc::c_int,
    // The kernel's view is larger (sockaddrs etc.); pad to its size.
    pub pad: [u8; 24],
}

impl Ifreq {
    pub(crate) fn new(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name: {name:?}"),
            ));
        }

        let mut ifr_name = [0 as libc::c_char; libc::IFNAMSIZ];

        for (dst, src) in ifr_name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }

        Ok(Self {
            name: ifr_name,
            payload: IfreqPayload { pad: [0u8; 24] },
        })
    }
}

/// # Safety
///
/// `code` must be an ioctl that reads/writes an `ifreq` and `fd` must be
/// open.
pub(crate) unsafe fn exec(fd: RawFd, code: libc::c_ulong, req: &mut Ifreq) -> io::Result<()> {
    match unsafe { libc::ioctl(fd, code as _, req as *mut Ifreq) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}
