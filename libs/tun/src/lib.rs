//! Virtual L3 tunnel devices.
//!
//! The kernel owns the device; this crate hands out a handle that can
//! receive and send single datagrams, adjust the MTU and flip the
//! interface up or down. The runner only sees the [`Tun`] trait so tests
//! can substitute an in-memory device.

use std::io;

#[cfg(target_os = "linux")]
mod ioctl;
#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::TunDevice;

#[async_trait::async_trait]
pub trait Tun: Send + Sync + 'static {
    /// Receives one datagram into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Sends one datagram.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// The name of the TUN device.
    fn name(&self) -> &str;
}

/// Whether an I/O error means the device itself is gone.
///
/// Transient conditions (buffer pressure, interrupts) are worth retrying;
/// anything else on a TUN fd means the interface was pulled from under us.
pub fn is_fatal(error: &io::Error) -> bool {
    !matches!(
        error.raw_os_error(),
        Some(libc::EINTR | libc::EAGAIN | libc::ENOBUFS | libc::ENOMEM)
    )
}
