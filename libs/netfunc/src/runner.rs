//! Drives one behavior over one tunnel device.

use crate::{Error, ErrorKind, NetFunc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tun::Tun;

/// Largest datagram we expect a tunnel to hand us.
const MAX_DATAGRAM: usize = 9216;

/// Per-kind drop counters. Shared between the runner task and whoever
/// wants to report them.
#[derive(Debug, Default)]
pub struct Counters {
    malformed: AtomicU64,
    out_of_range: AtomicU64,
    segments_left: AtomicU64,
    no_matching_rule: AtomicU64,
    encoding: AtomicU64,
    other: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    pub malformed: u64,
    pub out_of_range: u64,
    pub segments_left: u64,
    pub no_matching_rule: u64,
    pub encoding: u64,
    pub other: u64,
}

impl Counters {
    fn record(&self, error: &Error) {
        let counter = match error.kind() {
            ErrorKind::Malformed => &self.malformed,
            ErrorKind::OutOfRange => &self.out_of_range,
            ErrorKind::SegmentsLeftNonZero => &self.segments_left,
            ErrorKind::NoMatchingRule => &self.no_matching_rule,
            ErrorKind::Encoding => &self.encoding,
            ErrorKind::Other => &self.other,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            malformed: self.malformed.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            segments_left: self.segments_left.load(Ordering::Relaxed),
            no_matching_rule: self.no_matching_rule.load(Ordering::Relaxed),
            encoding: self.encoding.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
        }
    }
}

/// Owns one behavior and pumps packets between it and a tunnel device.
pub struct Runner {
    behavior: Arc<NetFunc>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(behavior: NetFunc) -> Self {
        Self {
            behavior: Arc::new(behavior),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Spawns the read/handle/write loop on the current runtime.
    pub fn start<T: Tun>(&mut self, device: T) {
        let behavior = Arc::clone(&self.behavior);
        let counters = Arc::clone(&self.counters);
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            run(device, behavior, counters, cancel).await;
        }));
    }

    /// Cancels the loop. The in-flight read is abandoned; a packet already
    /// in the handler completes.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run(device: impl Tun, behavior: Arc<NetFunc>, counters: Arc<Counters>, cancel: CancellationToken) {
    let name = device.name().to_owned();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    tracing::info!(iface = %name, behavior = behavior.behavior(), "Starting network function");

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = device.recv(&mut buf) => read,
        };

        let len = match read {
            Ok(len) => len,
            Err(e) if tun::is_fatal(&e) => {
                tracing::error!(iface = %name, "Tunnel device is gone: {e}");
                break;
            }
            Err(e) => {
                tracing::warn!(iface = %name, "Transient tunnel read error: {e}");
                continue;
            }
        };

        let out = match behavior.handle(&buf[..len]) {
            Ok(out) => out,
            Err(e) => {
                counters.record(&e);
                tracing::debug!(iface = %name, "Dropping packet: {e}");
                continue;
            }
        };

        match device.send(&out).await {
            Ok(_) => {}
            Err(e) if tun::is_fatal(&e) => {
                tracing::error!(iface = %name, "Tunnel device is gone: {e}");
                break;
            }
            Err(e) => {
                tracing::warn!(iface = %name, "Transient tunnel write error: {e}");
            }
        }
    }

    tracing::info!(iface = %name, counters = ?counters.snapshot(), "Network function stopped");
}
