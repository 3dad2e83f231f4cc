// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint link: where application code joins a chain.
//!
//! A *sink* endpoint queues every buffer it is sent until the application
//! takes it with [`Endpoint::get_full`] and hands it back with
//! [`Endpoint::put_empty`]. A *source* endpoint owns buffer pools: the
//! application takes an empty buffer with [`Endpoint::get_empty`], fills it
//! and sends it on with [`Endpoint::put_full`].
//!
//! ```no_run
//! use links::{LinkId, LinkType, ProcId, SystemContext, que::Timeout};
//!
//! # fn consume(sys: &SystemContext) -> Result<(), links::Error> {
//! let id = LinkId::new(ProcId::A15_0, LinkType::Endpoint, 0)?;
//! let sink = sys.endpoint(id)?;
//! while let Ok(buffer) = sink.get_full(Timeout::After(std::time::Duration::from_millis(100))) {
//!     println!("channel {} at {}us", buffer.ch_num, buffer.src_timestamp);
//!     sink.put_empty(buffer)?;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{
    Arc, Weak,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{alloc_pools, check_count, free_pools, release_upstream};
use crate::{
    Error, Result, SystemContext,
    buf_que::BufQue,
    buffer::{BufferList, SystemBuffer, timestamp_us},
    link::{
        CMD_NEW_DATA, ChInfo, InQueParams, Link, LinkInfo, LinkStatistics, MAX_CH_PER_QUE,
        OutQueParams, QueInfo, prev_que_info,
    },
    link_id::LinkId,
    que::{QUE_MAX_ELEMENTS, Que, Timeout},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum EndpointLinkParams {
    Sink {
        in_que: InQueParams,
    },
    Source {
        out_que: OutQueParams,
        channels: Vec<ChInfo>,
        #[serde(default = "default_num_buffers")]
        num_buffers: usize,
    },
}

fn default_num_buffers() -> usize {
    4
}

impl EndpointLinkParams {
    pub fn in_que(&self) -> Option<InQueParams> {
        match self {
            EndpointLinkParams::Sink { in_que } => Some(*in_que),
            EndpointLinkParams::Source { .. } => None,
        }
    }
}

enum Side {
    Sink {
        in_que: InQueParams,
        full: Que<SystemBuffer>,
    },
    Source {
        next_link: LinkId,
        channels: Vec<ChInfo>,
        num_buffers: usize,
        pools: Vec<BufQue>,
        handed_out: AtomicUsize,
    },
}

struct EndpointShared {
    id: LinkId,
    sys: Weak<SystemContext>,
    side: Side,
    stats: Mutex<LinkStatistics>,
}

impl EndpointShared {
    fn sys(&self) -> Result<Arc<SystemContext>> {
        self.sys
            .upgrade()
            .ok_or_else(|| Error::InvalidState(format!("{} has been shut down.", self.id)))
    }

    fn wrong_side(&self, what: &str) -> Error {
        Error::InvalidState(format!("{} cannot {what}.", self.id))
    }

    fn pool_of(&self, buffer: &SystemBuffer) -> Option<&BufQue> {
        let Side::Source {
            num_buffers, pools, ..
        } = &self.side
        else {
            return None;
        };
        let index = buffer.id().index as usize / num_buffers;
        pools.get(index).filter(|pool| pool.owns(buffer))
    }
}

/// Application handle of an endpoint link. Cheap to clone and usable from
/// any thread.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointShared>,
}

impl Endpoint {
    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.inner.side, Side::Sink { .. })
    }

    /// Takes the next buffer that arrived at a sink endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] or [`Error::Timeout`] when nothing arrives
    /// in time, and [`Error::InvalidState`] on a source endpoint or once the
    /// link is deleted.
    pub fn get_full(&self, timeout: Timeout) -> Result<SystemBuffer> {
        let Side::Sink { full, .. } = &self.inner.side else {
            return Err(self.inner.wrong_side("hand out full buffers"));
        };
        let buffer = full.get(timeout)?;
        self.inner.stats.lock().ch(0, buffer.ch_num).process += 1;
        Ok(buffer)
    }

    /// Returns a buffer taken with [`Endpoint::get_full`] to the link that
    /// produced it.
    pub fn put_empty(&self, buffer: SystemBuffer) -> Result<()> {
        let Side::Sink { in_que, .. } = &self.inner.side else {
            return Err(self.inner.wrong_side("take back empty buffers"));
        };
        let sys = self.inner.sys()?;
        sys.put_links_empty_buffers(
            in_que.prev_link_id,
            in_que.prev_link_que_id,
            BufferList::from(vec![buffer]),
        )
    }

    /// Takes an empty buffer of channel `ch` from a source endpoint's pool,
    /// waiting up to `timeout` for one to come back.
    pub fn get_empty(&self, ch: u32, timeout: Timeout) -> Result<SystemBuffer> {
        let Side::Source { pools, .. } = &self.inner.side else {
            return Err(self.inner.wrong_side("hand out empty buffers"));
        };
        let pool = pools
            .get(ch as usize)
            .ok_or_else(|| Error::InvalidParams(format!("{} has no channel {ch}.", self.id())))?;
        let mut buffer = pool.get_empty(timeout)?;
        buffer.ch_num = ch;
        Ok(buffer)
    }

    /// Sends a filled buffer downstream. A zero `src_timestamp` is replaced
    /// with the current time.
    pub fn put_full(&self, mut buffer: SystemBuffer) -> Result<()> {
        let Side::Source { next_link, .. } = &self.inner.side else {
            return Err(self.inner.wrong_side("send full buffers"));
        };
        let pool = self.inner.pool_of(&buffer).ok_or_else(|| {
            Error::InvalidParams(format!("{} does not own {}.", self.id(), buffer.id()))
        })?;
        if buffer.src_timestamp == 0 {
            buffer.src_timestamp = timestamp_us();
        }
        buffer.link_local_timestamp = timestamp_us();
        let ch = buffer.ch_num;
        pool.put_full(buffer)?;
        self.inner.stats.lock().ch(0, ch).out += 1;
        self.inner.sys()?.send_link_cmd(*next_link, CMD_NEW_DATA)
    }
}

pub struct EndpointLink {
    shared: Arc<EndpointShared>,
    info: LinkInfo,
}

impl EndpointLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: EndpointLinkParams) -> Result<Self> {
        let (side, info) = match params {
            EndpointLinkParams::Sink { in_que } => {
                prev_que_info(sys, &in_que)?;
                let full = Que::new(QUE_MAX_ELEMENTS, true, false)?;
                (Side::Sink { in_que, full }, LinkInfo::default())
            }
            EndpointLinkParams::Source {
                out_que,
                channels,
                num_buffers,
            } => {
                check_count("channels", channels.len(), MAX_CH_PER_QUE)?;
                if num_buffers == 0 {
                    return Err(Error::InvalidParams(format!(
                        "{id}: num_buffers must be non-zero."
                    )));
                }
                let pools = alloc_pools(sys.heap(), id, &channels, num_buffers, true)?;
                let info = LinkInfo {
                    queues: vec![QueInfo {
                        channels: channels.clone(),
                    }],
                };
                let side = Side::Source {
                    next_link: out_que.next_link,
                    channels,
                    num_buffers,
                    pools,
                    handed_out: AtomicUsize::new(0),
                };
                (side, info)
            }
        };
        Ok(Self {
            shared: Arc::new(EndpointShared {
                id,
                sys: sys.weak(),
                side,
                stats: Mutex::new(LinkStatistics::default()),
            }),
            info,
        })
    }
}

impl Link for EndpointLink {
    fn id(&self) -> LinkId {
        self.shared.id
    }

    fn link_info(&self) -> LinkInfo {
        self.info.clone()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let Side::Sink { in_que, full } = &self.shared.side else {
            return Ok(());
        };
        let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
        let mut overflow = Vec::new();
        {
            let mut stats = self.shared.stats.lock();
            for mut buffer in list {
                buffer.stamp_arrival();
                let ch = buffer.ch_num;
                stats.ch(0, ch).recv += 1;
                if let Err(rejected) = full.put(buffer, Timeout::NoWait) {
                    stats.ch(0, ch).drop += 1;
                    overflow.push(rejected.item);
                }
            }
        }
        if !overflow.is_empty() {
            tracing::warn!(
                "[{}] Application is not keeping up, returning {} buffers",
                self.shared.id,
                overflow.len()
            );
        }
        release_upstream(sys, self.shared.id, in_que, overflow);
        Ok(())
    }

    fn get_full_buffers(&self, _sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        let Side::Source {
            pools, handed_out, ..
        } = &self.shared.side
        else {
            return Err(Error::InvalidParams(format!(
                "{} has no output queue {que_id}.",
                self.shared.id
            )));
        };
        let mut list = BufferList::new();
        for pool in pools {
            pool.get_full_list(&mut list);
        }
        handed_out.fetch_add(list.len(), Ordering::AcqRel);
        Ok(list)
    }

    fn put_empty_buffers(&self, _sys: &SystemContext, _que_id: u8, list: BufferList) -> Result<()> {
        let Side::Source { handed_out, .. } = &self.shared.side else {
            return Err(Error::InvalidParams(format!(
                "{} has no output queue.",
                self.shared.id
            )));
        };
        for buffer in list {
            match self.shared.pool_of(&buffer) {
                Some(pool) => {
                    pool.put_empty(buffer)?;
                    handed_out.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    self.shared.stats.lock().in_buf_error_count += 1;
                    tracing::error!("[{}] Foreign buffer {} returned", self.shared.id, buffer.id());
                }
            }
        }
        Ok(())
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        match &self.shared.side {
            Side::Sink { in_que, full } => {
                full.shutdown();
                release_upstream(sys, self.shared.id, in_que, full.drain());
            }
            Side::Source {
                pools, channels, ..
            } => {
                tracing::debug!("[{}] Freeing {} source pools", self.shared.id, channels.len());
                free_pools(sys.heap(), pools);
            }
        }
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        let mut stats = self.shared.stats.lock().clone();
        if let Side::Sink { full, .. } = &self.shared.side {
            stats.bump("queued", full.len() as u64);
        }
        stats
    }

    fn pending_buffers(&self) -> usize {
        match &self.shared.side {
            Side::Sink { .. } => 0,
            Side::Source { handed_out, .. } => handed_out.load(Ordering::Acquire),
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint {
            inner: self.shared.clone(),
        })
    }
}
