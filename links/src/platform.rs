// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The set of processors a chain can span.

use std::{
    collections::BTreeMap,
    sync::{Arc, atomic::AtomicBool, atomic::Ordering},
};

use uuid::Uuid;

use crate::{
    Error, Result, SystemContext,
    config::SystemConfig,
    link_id::ProcId,
    notify::{NotifyBus, NotifyTransport},
    shared_mem::SharedHeap,
    system::Interconnect,
};

/// Owns one [`SystemContext`] per enabled processor together with what they
/// share: the heap, the notify bus and the IPC ring directory.
///
/// Dropping the platform deletes every link still registered and stops the
/// notify dispatchers.
///
/// # Examples
///
/// ```
/// use links::{Platform, ProcId, config::SystemConfig};
///
/// # fn main() -> Result<(), links::Error> {
/// let platform = Platform::new(&[ProcId::Ipu1_0, ProcId::Dsp1], SystemConfig::default())?;
/// let dsp = platform.context(ProcId::Dsp1)?;
/// assert_eq!(dsp.proc(), ProcId::Dsp1);
/// assert!(platform.context(ProcId::Eve1).is_err());
/// # Ok(())
/// # }
/// ```
pub struct Platform {
    id: Uuid,
    config: SystemConfig,
    heap: Arc<SharedHeap>,
    bus: Arc<NotifyBus>,
    contexts: BTreeMap<ProcId, Arc<SystemContext>>,
    shut_down: AtomicBool,
}

impl Platform {
    /// Brings up `procs`, each with its notify dispatcher attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] for an empty or repeated processor
    /// list or an invalid configuration.
    pub fn new(procs: &[ProcId], config: SystemConfig) -> Result<Self> {
        config.validate()?;
        if procs.is_empty() {
            return Err(Error::InvalidParams("A platform needs a processor.".into()));
        }
        let id = Uuid::new_v4();
        let heap = Arc::new(SharedHeap::new(config.shared_heap_bytes));
        let bus = Arc::new(NotifyBus::new(config.notify_que_depth));
        let transport: Arc<dyn NotifyTransport> = bus.clone();
        let shared = Arc::new(Interconnect::new(heap.clone(), transport));

        let mut contexts = BTreeMap::new();
        for &proc in procs {
            if contexts.contains_key(&proc) {
                bus.shutdown();
                return Err(Error::InvalidParams(format!("{proc} is listed twice.")));
            }
            let sys = SystemContext::new(proc, config.clone(), shared.clone());
            let weak = Arc::downgrade(&sys);
            if let Err(err) = bus.attach(proc, move |raw| {
                if let Some(sys) = weak.upgrade() {
                    sys.on_notify(raw);
                }
            }) {
                bus.shutdown();
                return Err(err);
            }
            contexts.insert(proc, sys);
        }
        tracing::info!(
            "Platform {id} up with {} processors, {} byte shared heap",
            contexts.len(),
            heap.capacity()
        );
        Ok(Self {
            id,
            config,
            heap,
            bus,
            contexts,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }

    /// Enabled processors, in numeric order.
    pub fn procs(&self) -> impl Iterator<Item = ProcId> + '_ {
        self.contexts.keys().copied()
    }

    /// The context of `proc`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] if `proc` is not enabled.
    pub fn context(&self, proc: ProcId) -> Result<Arc<SystemContext>> {
        self.contexts
            .get(&proc)
            .cloned()
            .ok_or_else(|| Error::InvalidParams(format!("{proc} is not enabled on this platform.")))
    }

    /// Deletes every link on every processor, then stops notify delivery.
    /// Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for sys in self.contexts.values().rev() {
            sys.shutdown();
        }
        self.bus.shutdown();
        if self.heap.block_count() > 0 {
            tracing::warn!(
                "Platform {} shut down with {} heap blocks still allocated",
                self.id,
                self.heap.block_count()
            );
        }
        tracing::info!("Platform {} down", self.id);
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shutdown();
    }
}
