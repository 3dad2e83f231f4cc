// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Per-processor link registry and command routing.
//!
//! A [`SystemContext`] owns every link created on one processor. It is the
//! only way links reach each other: buffer exchange with a neighbour goes
//! through [`SystemContext::get_links_full_buffers`] and
//! [`SystemContext::put_links_empty_buffers`], and wakeups through
//! [`SystemContext::send_link_cmd`], which uses the local mailbox for links on
//! the same processor and a notify for links elsewhere.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::{
    Error, Result,
    buffer::BufferList,
    config::SystemConfig,
    ipc_que::{IpcQueReader, IpcQueWriter},
    link::{
        CMD_DELETE, CMD_GET_INFO, CMD_NEW_DATA, CMD_PRINT_STATISTICS, CMD_RELEASE_DATA, CMD_START,
        CMD_STOP, Link, LinkCmd, LinkInfo, LinkState, LinkStatistics,
    },
    link_id::{LinkId, NotifyPayload, ProcId},
    links::{LinkCreateParams, endpoint::Endpoint},
    notify::NotifyTransport,
    shared_mem::SharedHeap,
    task::{LinkTask, ReplyTo},
};

/// Control request addressed to a link on another processor.
pub(crate) struct RemoteMsg {
    src: ProcId,
    link_id: LinkId,
    cmd: LinkCmd,
    reply: Sender<Result<Vec<u8>>>,
}

/// Rings handed from an IPC-Out link to the IPC-In link it feeds.
pub(crate) struct IpcRingEnds {
    pub(crate) out_link: LinkId,
    pub(crate) forward: IpcQueReader,
    pub(crate) ret: IpcQueWriter,
}

/// State reachable from every processor: the shared heap, the notify
/// transport, remote message ports and the IPC ring directory.
pub(crate) struct Interconnect {
    pub(crate) heap: Arc<SharedHeap>,
    pub(crate) notify: Arc<dyn NotifyTransport>,
    msg_ports: RwLock<HashMap<ProcId, Sender<RemoteMsg>>>,
    ipc_rings: Mutex<HashMap<LinkId, IpcRingEnds>>,
}

impl Interconnect {
    pub(crate) fn new(heap: Arc<SharedHeap>, notify: Arc<dyn NotifyTransport>) -> Self {
        Self {
            heap,
            notify,
            msg_ports: RwLock::new(HashMap::new()),
            ipc_rings: Mutex::new(HashMap::new()),
        }
    }

    /// Leaves the far ends of an IPC-Out link's rings for `in_link`.
    pub(crate) fn offer_rings(&self, in_link: LinkId, ends: IpcRingEnds) -> Result<()> {
        let mut rings = self.ipc_rings.lock();
        if rings.contains_key(&in_link) {
            return Err(Error::InvalidState(format!(
                "IPC rings for {in_link} are already on offer."
            )));
        }
        rings.insert(in_link, ends);
        Ok(())
    }

    pub(crate) fn take_rings(&self, in_link: LinkId) -> Result<IpcRingEnds> {
        self.ipc_rings.lock().remove(&in_link).ok_or_else(|| {
            Error::InvalidState(format!("No IPC-Out link feeds {in_link}."))
        })
    }

    /// Withdraws rings nobody picked up.
    pub(crate) fn withdraw_rings(&self, in_link: LinkId) -> Option<IpcRingEnds> {
        self.ipc_rings.lock().remove(&in_link)
    }
}

struct Registered {
    link: Arc<dyn Link>,
    task: LinkTask,
}

/// Link registry of one processor.
///
/// Created by [`crate::Platform`], one per enabled processor, and shared by
/// `Arc` with the link tasks it spawns.
pub struct SystemContext {
    proc: ProcId,
    config: SystemConfig,
    shared: Arc<Interconnect>,
    links: RwLock<HashMap<LinkId, Arc<Registered>>>,
    /// Creation order, for orderly shutdown.
    order: Mutex<Vec<LinkId>>,
    msg_rx: Receiver<RemoteMsg>,
    weak_self: Weak<SystemContext>,
}

impl SystemContext {
    pub(crate) fn new(proc: ProcId, config: SystemConfig, shared: Arc<Interconnect>) -> Arc<Self> {
        let (msg_tx, msg_rx) = crossbeam_channel::bounded(config.mailbox_depth);
        shared.msg_ports.write().insert(proc, msg_tx);
        Arc::new_cyclic(|weak_self| Self {
            proc,
            config,
            shared,
            links: RwLock::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            msg_rx,
            weak_self: weak_self.clone(),
        })
    }

    pub fn proc(&self) -> ProcId {
        self.proc
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn heap(&self) -> &SharedHeap {
        &self.shared.heap
    }

    pub(crate) fn notify(&self) -> &dyn NotifyTransport {
        &*self.shared.notify
    }

    pub(crate) fn interconnect(&self) -> &Interconnect {
        &self.shared
    }

    pub(crate) fn weak(&self) -> Weak<SystemContext> {
        self.weak_self.clone()
    }

    /// Creates a link on this processor and starts its task.
    ///
    /// # Arguments
    ///
    /// * `id` - Address of the new link; must be on this processor
    /// * `params` - Link kind and configuration; validated against the
    ///   layout of the links it reads from
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLinkId`] for an id on another processor,
    /// [`Error::InvalidState`] if the id is taken, and any validation error
    /// from the link itself. Only IPC-In links may read from a link on
    /// another processor.
    pub fn create_link(&self, id: LinkId, params: LinkCreateParams) -> Result<()> {
        if id.proc() != self.proc {
            return Err(Error::InvalidLinkId(id.encode()));
        }
        if self.links.read().contains_key(&id) {
            return Err(Error::InvalidState(format!("{id} already exists.")));
        }
        let link = params.create(self, id)?;
        let task = LinkTask::spawn(link.clone(), self.weak_self.clone(), self.config.mailbox_depth)?;
        self.links
            .write()
            .insert(id, Arc::new(Registered { link, task }));
        self.order.lock().push(id);
        tracing::info!("[{id}] Created");
        Ok(())
    }

    pub fn start_link(&self, id: LinkId) -> Result<()> {
        self.admin(id, LinkCmd::new(CMD_START)).map(drop)
    }

    pub fn stop_link(&self, id: LinkId) -> Result<()> {
        self.admin(id, LinkCmd::new(CMD_STOP)).map(drop)
    }

    /// Deletes a link: stops it if running, lets it return everything it
    /// holds, then removes it from the registry.
    pub fn delete_link(&self, id: LinkId) -> Result<()> {
        let entry = self.registered(id)?;
        self.admin(id, LinkCmd::new(CMD_DELETE))?;
        self.links.write().remove(&id);
        self.order.lock().retain(|other| *other != id);
        entry.task.join();
        Ok(())
    }

    /// Sends a control command to any link and waits for its reply.
    ///
    /// Links on other processors are reached through their processor's
    /// message port and a `MSG` notify.
    pub fn link_control(&self, id: LinkId, cmd: LinkCmd) -> Result<Vec<u8>> {
        if id.proc() == self.proc {
            self.admin(id, cmd)
        } else {
            self.remote(id, cmd)
        }
    }

    /// Posts a command without waiting for it to be handled.
    ///
    /// `NEW_DATA` and `RELEASE_DATA` to another processor travel as a link
    /// notify; the receiving link decides which of the two it means.
    pub fn send_link_cmd(&self, id: LinkId, code: u32) -> Result<()> {
        if id.proc() != self.proc {
            if code == CMD_NEW_DATA || code == CMD_RELEASE_DATA {
                return self.config.transport_policy.send(
                    self.notify(),
                    id.proc(),
                    NotifyPayload::Link(id),
                );
            }
            let (tx, _rx) = crossbeam_channel::bounded(1);
            return self.post_remote(id, LinkCmd::new(code), tx);
        }
        let entry = self.registered(id)?;
        match code {
            CMD_NEW_DATA => entry.task.post_new_data(),
            CMD_RELEASE_DATA => entry.task.post_release_data(),
            _ => {
                let (tx, _rx) = crossbeam_channel::bounded(1);
                entry.task.post_cmd(
                    LinkCmd::new(code),
                    ReplyTo {
                        tx,
                        requester: None,
                    },
                    self.config.ack_timeout(),
                )
            }
        }
    }

    /// Takes the full buffers waiting on `que_id` of a local link.
    pub fn get_links_full_buffers(&self, id: LinkId, que_id: u8) -> Result<BufferList> {
        self.local(id)?.get_full_buffers(self, que_id)
    }

    /// Returns buffers to the local link that handed them out.
    pub fn put_links_empty_buffers(&self, id: LinkId, que_id: u8, list: BufferList) -> Result<()> {
        if list.is_empty() {
            return Ok(());
        }
        match self.local(id) {
            Ok(link) => link.put_empty_buffers(self, que_id, list),
            Err(err) => {
                tracing::error!("Returning {} buffers to missing {id}", list.len());
                Err(err)
            }
        }
    }

    /// Output layout of any link, local or remote.
    pub fn link_get_info(&self, id: LinkId) -> Result<LinkInfo> {
        if id.proc() == self.proc {
            Ok(self.local(id)?.link_info())
        } else {
            let reply = self.remote(id, LinkCmd::new(CMD_GET_INFO))?;
            Ok(serde_json::from_slice(&reply)?)
        }
    }

    /// Statistics of any link, local or remote.
    pub fn link_statistics(&self, id: LinkId) -> Result<LinkStatistics> {
        if id.proc() == self.proc {
            let entry = self.registered(id)?;
            let mut stats = entry.link.statistics();
            stats.new_data_cmds = entry.task.new_data_cmds();
            stats.release_data_cmds = entry.task.release_data_cmds();
            Ok(stats)
        } else {
            let reply = self.remote(id, LinkCmd::new(CMD_PRINT_STATISTICS))?;
            Ok(serde_json::from_slice(&reply)?)
        }
    }

    pub fn link_state(&self, id: LinkId) -> Result<LinkState> {
        Ok(self.registered(id)?.task.state())
    }

    /// Buffers a local link has handed downstream and not yet got back.
    pub fn pending_buffers(&self, id: LinkId) -> Result<usize> {
        Ok(self.local(id)?.pending_buffers())
    }

    /// Application handle of a local endpoint link.
    pub fn endpoint(&self, id: LinkId) -> Result<Endpoint> {
        self.local(id)?
            .endpoint()
            .ok_or_else(|| Error::InvalidParams(format!("{id} is not an endpoint link.")))
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.links.read().contains_key(&id)
    }

    /// Ids of the registered links, in creation order.
    pub fn link_ids(&self) -> Vec<LinkId> {
        self.order.lock().clone()
    }

    /// Deletes every link, newest first.
    pub fn shutdown(&self) {
        let ids: Vec<LinkId> = self.order.lock().iter().rev().copied().collect();
        for id in ids {
            if let Err(err) = self.delete_link(id) {
                tracing::error!("[{id}] Delete during shutdown failed: {err}");
            }
        }
    }

    /// Entry point of this processor's notify dispatcher.
    pub(crate) fn on_notify(&self, raw: u32) {
        let payload = match NotifyPayload::decode(raw) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("{}: dropping notify {raw:#010x}: {err}", self.proc);
                return;
            }
        };
        match payload {
            NotifyPayload::Link(id) => {
                let Ok(entry) = self.registered(id) else {
                    tracing::warn!("{}: notify for unknown link {id}", self.proc);
                    return;
                };
                let result = match entry.link.notify_cmd() {
                    CMD_RELEASE_DATA => entry.task.post_release_data(),
                    _ => entry.task.post_new_data(),
                };
                if let Err(err) = result {
                    tracing::warn!("[{id}] Notify not delivered: {err}");
                }
            }
            NotifyPayload::Msg { src } => {
                tracing::trace!("{}: message from {src}", self.proc);
                for msg in self.msg_rx.try_iter() {
                    self.dispatch_remote(msg);
                }
            }
            NotifyPayload::MsgAck { src } => {
                tracing::trace!("{}: ack from {src}", self.proc);
            }
        }
    }

    fn dispatch_remote(&self, msg: RemoteMsg) {
        let RemoteMsg {
            src,
            link_id,
            cmd,
            reply,
        } = msg;
        let posted = self.registered(link_id).and_then(|entry| {
            entry.task.post_cmd(
                cmd,
                ReplyTo {
                    tx: reply.clone(),
                    requester: Some(src),
                },
                self.config.ack_timeout(),
            )
        });
        if let Err(err) = posted
            && reply.send(Err(err)).is_err()
        {
            tracing::debug!("[{link_id}] Requester on {src} stopped waiting");
        }
    }

    fn admin(&self, id: LinkId, cmd: LinkCmd) -> Result<Vec<u8>> {
        let entry = self.registered(id)?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let code = cmd.code;
        entry.task.post_cmd(
            cmd,
            ReplyTo {
                tx,
                requester: None,
            },
            self.config.ack_timeout(),
        )?;
        rx.recv_timeout(self.config.ack_timeout()).map_err(|_| {
            tracing::error!("[{id}] No acknowledgement for command {code:#x}");
            Error::Timeout
        })?
    }

    fn remote(&self, id: LinkId, cmd: LinkCmd) -> Result<Vec<u8>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let code = cmd.code;
        self.post_remote(id, cmd, tx)?;
        rx.recv_timeout(self.config.ack_timeout()).map_err(|_| {
            tracing::error!("[{id}] No acknowledgement from {} for command {code:#x}", id.proc());
            Error::Timeout
        })?
    }

    fn post_remote(&self, id: LinkId, cmd: LinkCmd, reply: Sender<Result<Vec<u8>>>) -> Result<()> {
        {
            let ports = self.shared.msg_ports.read();
            let port = ports
                .get(&id.proc())
                .ok_or(Error::InvalidLinkId(id.encode()))?;
            port.try_send(RemoteMsg {
                src: self.proc,
                link_id: id,
                cmd,
                reply,
            })
            .map_err(|_| Error::Other(format!("message port of {} is unavailable", id.proc())))?;
        }
        self.config
            .transport_policy
            .send(self.notify(), id.proc(), NotifyPayload::Msg { src: self.proc })
    }

    fn registered(&self, id: LinkId) -> Result<Arc<Registered>> {
        self.links
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidLinkId(id.encode()))
    }

    fn local(&self, id: LinkId) -> Result<Arc<dyn Link>> {
        Ok(self.registered(id)?.link.clone())
    }
}

impl Drop for SystemContext {
    fn drop(&mut self) {
        self.shared.msg_ports.write().remove(&self.proc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LinkType, notify::NotifyBus};

    fn context() -> Arc<SystemContext> {
        let shared = Arc::new(Interconnect::new(
            Arc::new(SharedHeap::new(1 << 20)),
            Arc::new(NotifyBus::new(8)),
        ));
        SystemContext::new(ProcId::Ipu1_0, SystemConfig::default(), shared)
    }

    #[test]
    fn unknown_link_is_invalid() {
        let sys = context();
        let id = LinkId::new(ProcId::Ipu1_0, LinkType::Dup, 0).unwrap();
        assert!(matches!(sys.start_link(id), Err(Error::InvalidLinkId(_))));
        assert!(matches!(
            sys.get_links_full_buffers(id, 0),
            Err(Error::InvalidLinkId(_))
        ));
        assert_eq!(
            sys.start_link(id).unwrap_err().status(),
            crate::error::status::EFAIL
        );
    }

    #[test]
    fn remote_id_is_rejected_at_create() {
        let sys = context();
        let id = LinkId::new(ProcId::Dsp1, LinkType::Null, 0).unwrap();
        let params = LinkCreateParams::Null(crate::links::null::NullLinkParams {
            in_queues: Vec::new(),
            dump: Default::default(),
        });
        assert!(matches!(
            sys.create_link(id, params),
            Err(Error::InvalidLinkId(_))
        ));
    }
}
