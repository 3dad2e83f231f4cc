// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Link task: the one thread that drives a link's state machine.
//!
//! Commands arrive on a bounded mailbox. `NEW_DATA` and `RELEASE_DATA` are
//! coalesced through pending flags so a burst of notifications costs one
//! mailbox slot; administrative commands carry a reply channel and are
//! answered once handled.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::{
    Error, Result, SystemContext,
    link::{
        CMD_DELETE, CMD_GET_INFO, CMD_NEW_DATA, CMD_PRINT_STATISTICS, CMD_RELEASE_DATA, CMD_START,
        CMD_STOP, Link, LinkCmd, LinkState,
    },
    link_id::{LinkId, NotifyPayload, ProcId},
};

/// Where the answer to an administrative command goes.
pub(crate) struct ReplyTo {
    pub(crate) tx: Sender<Result<Vec<u8>>>,
    /// Set when the request came from another processor, which is then
    /// notified with `MSG_ACK` once the reply is posted.
    pub(crate) requester: Option<ProcId>,
}

pub(crate) enum TaskMsg {
    NewData,
    ReleaseData,
    Admin { cmd: LinkCmd, reply: ReplyTo },
}

/// Flags and counters shared between a task thread and its handle.
struct TaskShared {
    new_data_pending: AtomicBool,
    release_pending: AtomicBool,
    new_data_cmds: AtomicU64,
    release_data_cmds: AtomicU64,
    state: Mutex<LinkState>,
}

pub(crate) struct LinkTask {
    link_id: LinkId,
    mailbox: Sender<TaskMsg>,
    shared: Arc<TaskShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LinkTask {
    pub(crate) fn spawn(
        link: Arc<dyn Link>,
        sys: Weak<SystemContext>,
        mailbox_depth: usize,
    ) -> Result<Self> {
        let link_id = link.id();
        let (mailbox, rx) = crossbeam_channel::bounded(mailbox_depth);
        let shared = Arc::new(TaskShared {
            new_data_pending: AtomicBool::new(false),
            release_pending: AtomicBool::new(false),
            new_data_cmds: AtomicU64::new(0),
            release_data_cmds: AtomicU64::new(0),
            state: Mutex::new(LinkState::Created),
        });
        let handle = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("link-{link_id}"))
                .spawn(move || run(link, sys, rx, shared))?
        };
        Ok(Self {
            link_id,
            mailbox,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn post_new_data(&self) -> Result<()> {
        self.post_coalesced(&self.shared.new_data_pending, TaskMsg::NewData)
    }

    pub(crate) fn post_release_data(&self) -> Result<()> {
        self.post_coalesced(&self.shared.release_pending, TaskMsg::ReleaseData)
    }

    /// Queues an administrative command, waiting up to `timeout` for a
    /// mailbox slot.
    pub(crate) fn post_cmd(&self, cmd: LinkCmd, reply: ReplyTo, timeout: Duration) -> Result<()> {
        self.mailbox
            .send_timeout(TaskMsg::Admin { cmd, reply }, timeout)
            .map_err(|err| {
                if err.is_timeout() {
                    Error::Timeout
                } else {
                    self.gone()
                }
            })
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.shared.state.lock()
    }

    pub(crate) fn new_data_cmds(&self) -> u64 {
        self.shared.new_data_cmds.load(Ordering::Relaxed)
    }

    pub(crate) fn release_data_cmds(&self) -> u64 {
        self.shared.release_data_cmds.load(Ordering::Relaxed)
    }

    /// Waits for the task thread to exit. Only returns promptly once the task
    /// has handled `DELETE`.
    pub(crate) fn join(&self) {
        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            tracing::error!("Task of {} panicked", self.link_id);
        }
    }

    fn post_coalesced(&self, pending: &AtomicBool, msg: TaskMsg) -> Result<()> {
        if pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.mailbox.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                pending.store(false, Ordering::Release);
                tracing::warn!("Mailbox of {} is full, dropping wakeup", self.link_id);
                Err(Error::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                pending.store(false, Ordering::Release);
                Err(self.gone())
            }
        }
    }

    fn gone(&self) -> Error {
        Error::InvalidState(format!("{} has been deleted.", self.link_id))
    }
}

fn run(link: Arc<dyn Link>, sys: Weak<SystemContext>, rx: Receiver<TaskMsg>, shared: Arc<TaskShared>) {
    let link_id = link.id();
    let ticker = match link.tick_interval() {
        Some(interval) => crossbeam_channel::tick(interval),
        None => crossbeam_channel::never(),
    };
    tracing::trace!("[{link_id}] Task started");

    loop {
        crossbeam_channel::select! {
            recv(rx) -> msg => {
                let Ok(msg) = msg else { break };
                let Some(sys) = sys.upgrade() else { break };
                if handle(&*link, &sys, msg, &shared) {
                    break;
                }
            }
            recv(ticker) -> _ => {
                if *shared.state.lock() != LinkState::Started {
                    continue;
                }
                let Some(sys) = sys.upgrade() else { break };
                if let Err(err) = link.on_tick(&sys) {
                    tracing::warn!("[{link_id}] Tick failed: {err}");
                }
            }
        }
    }
    tracing::trace!("[{link_id}] Task exited");
}

/// Handles one message. Returns `true` once the link is deleted.
fn handle(link: &dyn Link, sys: &SystemContext, msg: TaskMsg, shared: &TaskShared) -> bool {
    let link_id = link.id();
    match msg {
        TaskMsg::NewData => {
            shared.new_data_pending.store(false, Ordering::Release);
            shared.new_data_cmds.fetch_add(1, Ordering::Relaxed);
            if *shared.state.lock() == LinkState::Started
                && let Err(err) = link.process_new_data(sys)
            {
                tracing::warn!("[{link_id}] NEW_DATA failed: {err}");
            }
            false
        }
        TaskMsg::ReleaseData => {
            shared.release_pending.store(false, Ordering::Release);
            shared.release_data_cmds.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = link.release_data(sys) {
                tracing::warn!("[{link_id}] RELEASE_DATA failed: {err}");
            }
            false
        }
        TaskMsg::Admin { cmd, reply } => {
            let code = cmd.code;
            let result = admin(link, sys, cmd, shared);
            if let Err(err) = &result {
                tracing::debug!("[{link_id}] Command {code:#x} failed: {err}");
            }
            let deleted = code == CMD_DELETE && result.is_ok();
            if reply.tx.send(result).is_err() {
                // requester timed out and dropped its receiver
                tracing::debug!("[{link_id}] Reply to {code:#x} dropped");
            }
            if let Some(requester) = reply.requester
                && let Err(err) = sys.config().transport_policy.send(
                    sys.notify(),
                    requester,
                    NotifyPayload::MsgAck { src: sys.proc() },
                )
            {
                tracing::warn!("[{link_id}] Could not acknowledge {requester}: {err}");
            }
            deleted
        }
    }
}

fn admin(link: &dyn Link, sys: &SystemContext, cmd: LinkCmd, shared: &TaskShared) -> Result<Vec<u8>> {
    let link_id = link.id();
    let state = *shared.state.lock();
    match cmd.code {
        CMD_START => match state {
            LinkState::Created | LinkState::Stopped => {
                link.start(sys)?;
                *shared.state.lock() = LinkState::Started;
                tracing::info!("[{link_id}] Started");
                Ok(Vec::new())
            }
            other => Err(Error::InvalidState(format!(
                "{link_id} cannot start while {other}."
            ))),
        },
        CMD_STOP => {
            if state == LinkState::Started {
                link.stop(sys)?;
                *shared.state.lock() = LinkState::Stopped;
                tracing::info!("[{link_id}] Stopped");
            }
            Ok(Vec::new())
        }
        CMD_DELETE => {
            if state == LinkState::Started
                && let Err(err) = link.stop(sys)
            {
                tracing::warn!("[{link_id}] Stop before delete failed: {err}");
            }
            link.delete(sys)?;
            *shared.state.lock() = LinkState::Deleted;
            tracing::info!("[{link_id}] Deleted");
            Ok(Vec::new())
        }
        CMD_NEW_DATA => {
            if state == LinkState::Started {
                link.process_new_data(sys)?;
            }
            Ok(Vec::new())
        }
        CMD_RELEASE_DATA => {
            link.release_data(sys)?;
            Ok(Vec::new())
        }
        CMD_GET_INFO => Ok(serde_json::to_vec(&link.link_info())?),
        CMD_PRINT_STATISTICS => {
            let mut stats = link.statistics();
            stats.new_data_cmds = shared.new_data_cmds.load(Ordering::Relaxed);
            stats.release_data_cmds = shared.release_data_cmds.load(Ordering::Relaxed);
            let json = serde_json::to_string(&stats)?;
            tracing::info!("[{link_id}] Statistics: {json}");
            Ok(json.into_bytes())
        }
        _ => link.control(sys, &cmd),
    }
}
