// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Cross-core notification.
//!
//! A notify is a 4-byte value (see [`NotifyPayload`]) delivered to a processor's
//! dispatcher, which decodes it and wakes the addressed link. The transport is
//! abstracted by [`NotifyTransport`]; [`NotifyBus`] is the in-process
//! implementation used by [`crate::Platform`], with one dispatcher thread per
//! attached processor.
//!
//! Sends never block. A full receive queue is reported as
//! [`TransportError::Busy`] and the caller's [`TransportPolicy`] decides whether
//! to retry or escalate.

use std::{collections::HashMap, thread::JoinHandle, time::Duration};

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, error::TransportError, link_id::NotifyPayload, link_id::ProcId};

/// Delivers notify payloads to processors.
pub trait NotifyTransport: Send + Sync {
    /// Queues `payload` for the dispatcher of `dest` without blocking.
    fn send(&self, dest: ProcId, payload: u32) -> core::result::Result<(), TransportError>;
}

/// How a failed notify send is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportPolicy {
    /// Report the first failure to the caller.
    Escalate,
    /// Retry a busy transport up to `attempts` times, sleeping `backoff_ms`
    /// (doubled after every attempt) in between, then report the failure.
    Retry { attempts: u32, backoff_ms: u64 },
}

impl Default for TransportPolicy {
    fn default() -> Self {
        TransportPolicy::Retry {
            attempts: 3,
            backoff_ms: 1,
        }
    }
}

impl TransportPolicy {
    /// Sends `payload` to `dest` under this policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] once the policy gives up.
    pub fn send(
        &self,
        transport: &dyn NotifyTransport,
        dest: ProcId,
        payload: NotifyPayload,
    ) -> Result<()> {
        let raw = payload.encode();
        let (attempts, mut backoff) = match *self {
            TransportPolicy::Escalate => (0, Duration::ZERO),
            TransportPolicy::Retry {
                attempts,
                backoff_ms,
            } => (attempts, Duration::from_millis(backoff_ms)),
        };

        let mut tries = 0;
        loop {
            match transport.send(dest, raw) {
                Ok(()) => return Ok(()),
                Err(TransportError::Busy(proc)) if tries < attempts => {
                    tracing::debug!(
                        "Notify to {proc} busy, retry {}/{attempts} in {backoff:?}",
                        tries + 1
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    tries += 1;
                }
                Err(err) => {
                    tracing::error!("Notify {raw:#010x} to {dest} failed: {err}");
                    return Err(Error::Transport(err));
                }
            }
        }
    }
}

/// In-process notify transport.
///
/// Every attached processor gets a bounded queue and a dispatcher thread that
/// calls the processor's handler for each payload in arrival order.
///
/// # Examples
///
/// ```
/// use std::sync::mpsc;
/// use links::{ProcId, notify::{NotifyBus, NotifyTransport}};
///
/// # fn main() -> Result<(), links::Error> {
/// let bus = NotifyBus::new(16);
/// let (tx, rx) = mpsc::channel();
/// bus.attach(ProcId::Dsp1, move |payload| {
///     let _ = tx.send(payload);
/// })?;
/// bus.send(ProcId::Dsp1, 0x0304)?;
/// assert_eq!(rx.recv().ok(), Some(0x0304));
/// bus.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct NotifyBus {
    depth: usize,
    ports: RwLock<HashMap<ProcId, Sender<u32>>>,
    dispatchers: Mutex<HashMap<ProcId, JoinHandle<()>>>,
}

impl NotifyBus {
    /// Creates a bus whose per-processor queues hold `depth` payloads.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            ports: RwLock::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a processor and starts its dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the processor is already attached, or
    /// [`Error::Io`] if the dispatcher thread cannot be spawned.
    pub fn attach<F>(&self, proc: ProcId, handler: F) -> Result<()>
    where
        F: Fn(u32) + Send + 'static,
    {
        let mut ports = self.ports.write();
        if ports.contains_key(&proc) {
            return Err(Error::InvalidState(format!(
                "{proc} is already attached to the notify bus."
            )));
        }
        let (tx, rx) = crossbeam_channel::bounded::<u32>(self.depth);
        let handle = std::thread::Builder::new()
            .name(format!("notify-{proc}"))
            .spawn(move || {
                tracing::trace!("Notify dispatcher for {proc} running");
                for payload in rx.iter() {
                    handler(payload);
                }
                tracing::trace!("Notify dispatcher for {proc} exited");
            })?;
        ports.insert(proc, tx);
        self.dispatchers.lock().insert(proc, handle);
        tracing::debug!("{proc} attached to notify bus");
        Ok(())
    }

    /// Detaches a processor. Payloads already queued are still dispatched.
    pub fn detach(&self, proc: ProcId) {
        self.ports.write().remove(&proc);
        if let Some(handle) = self.dispatchers.lock().remove(&proc)
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            tracing::error!("Notify dispatcher for {proc} panicked");
        }
    }

    pub fn is_attached(&self, proc: ProcId) -> bool {
        self.ports.read().contains_key(&proc)
    }

    /// Detaches every processor.
    pub fn shutdown(&self) {
        let procs: Vec<ProcId> = self.ports.read().keys().copied().collect();
        for proc in procs {
            self.detach(proc);
        }
    }
}

impl NotifyTransport for NotifyBus {
    fn send(&self, dest: ProcId, payload: u32) -> core::result::Result<(), TransportError> {
        let ports = self.ports.read();
        let port = ports.get(&dest).ok_or(TransportError::Unavailable(dest))?;
        port.try_send(payload).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Busy(dest),
            TrySendError::Disconnected(_) => TransportError::Disconnected,
        })
    }
}

impl Drop for NotifyBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Reports busy for the first `failures` sends.
    struct Flaky {
        failures: AtomicU32,
        delivered: AtomicU32,
    }

    impl NotifyTransport for Flaky {
        fn send(&self, dest: ProcId, _payload: u32) -> core::result::Result<(), TransportError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Busy(dest));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn payload() -> NotifyPayload {
        NotifyPayload::Msg { src: ProcId::A15_0 }
    }

    #[test]
    fn retry_policy_absorbs_transient_busy() {
        let flaky = Flaky {
            failures: AtomicU32::new(2),
            delivered: AtomicU32::new(0),
        };
        let policy = TransportPolicy::Retry {
            attempts: 3,
            backoff_ms: 0,
        };
        policy.send(&flaky, ProcId::Dsp1, payload()).unwrap();
        assert_eq!(flaky.delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn escalate_policy_reports_first_failure() {
        let flaky = Flaky {
            failures: AtomicU32::new(1),
            delivered: AtomicU32::new(0),
        };
        let err = TransportPolicy::Escalate
            .send(&flaky, ProcId::Dsp1, payload())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Busy(ProcId::Dsp1))
        ));
    }

    #[test]
    fn unattached_processor_is_unavailable() {
        let bus = NotifyBus::new(4);
        assert_eq!(
            bus.send(ProcId::Eve1, 0),
            Err(TransportError::Unavailable(ProcId::Eve1))
        );
    }
}
