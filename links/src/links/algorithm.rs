// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Algorithm link: hosts an [`AlgorithmPlugin`].
//!
//! The link owns the plumbing: it pulls input buffers, hands each one to the
//! plugin together with an empty output buffer from its own pool, forwards
//! the result and returns the input upstream. Without an output queue the
//! plugin runs as a sink and only sees inputs.

use std::fmt;

use parking_lot::Mutex;

use super::{alloc_pools, free_pools, release_upstream};
use crate::{
    Error, Result, SystemContext,
    buf_que::BufQue,
    buffer::{BufferList, SystemBuffer},
    link::{
        CMD_NEW_DATA, InQueParams, Link, LinkCmd, LinkInfo, LinkStatistics, MAX_CH_PER_QUE,
        OutQueParams, QueInfo, prev_que_info,
    },
    link_id::LinkId,
    que::Timeout,
    shared_mem::SharedHeap,
};

/// Processing stage run by an Algorithm link.
///
/// Every call comes from the link's own task thread, so implementations only
/// need to be [`Send`].
pub trait AlgorithmPlugin: Send {
    fn name(&self) -> &str;

    /// Prepares the plugin for `input` and returns the layout of its output.
    ///
    /// The returned layout is ignored when the link has no output queue.
    ///
    /// # Arguments
    ///
    /// * `input` - Layout of the queue the link reads from
    /// * `heap` - Shared heap, for plugins that need scratch memory
    ///
    /// # Errors
    ///
    /// Returning an error fails the link's creation.
    fn create(&mut self, input: &QueInfo, heap: &SharedHeap) -> Result<QueInfo>;

    /// Processes one input buffer. `output` is an empty buffer on the same
    /// channel, or `None` for a sink.
    fn process(&mut self, input: &SystemBuffer, output: Option<&mut SystemBuffer>) -> Result<()>;

    fn control(&mut self, cmd: &LinkCmd) -> Result<Vec<u8>> {
        Err(Error::UnsupportedCmd(cmd.code))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct AlgorithmLinkParams {
    pub in_que: InQueParams,
    pub out_que: Option<OutQueParams>,
    /// Output buffers per channel; `0` runs the plugin as a sink.
    pub num_out_buffers: usize,
    pub plugin: Box<dyn AlgorithmPlugin>,
}

impl fmt::Debug for AlgorithmLinkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmLinkParams")
            .field("in_que", &self.in_que)
            .field("out_que", &self.out_que)
            .field("num_out_buffers", &self.num_out_buffers)
            .field("plugin", &self.plugin.name())
            .finish()
    }
}

struct Output {
    next_link: LinkId,
    info: QueInfo,
    num_buffers: usize,
    pools: Vec<BufQue>,
}

pub struct AlgorithmLink {
    id: LinkId,
    in_que: InQueParams,
    output: Option<Output>,
    plugin: Mutex<Box<dyn AlgorithmPlugin>>,
    stats: Mutex<LinkStatistics>,
}

impl AlgorithmLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: AlgorithmLinkParams) -> Result<Self> {
        let AlgorithmLinkParams {
            in_que,
            out_que,
            num_out_buffers,
            mut plugin,
        } = params;
        let input = prev_que_info(sys, &in_que)?;
        let out_info = plugin.create(&input, sys.heap())?;
        tracing::info!("[{id}] Plugin {} created", plugin.name());

        let output = match out_que {
            Some(out_que) if num_out_buffers > 0 => {
                let pools = Self::output_pools(sys, id, plugin.name(), &out_info, num_out_buffers);
                match pools {
                    Ok(pools) => Some(Output {
                        next_link: out_que.next_link,
                        info: out_info,
                        num_buffers: num_out_buffers,
                        pools,
                    }),
                    Err(err) => {
                        if let Err(delete_err) = plugin.delete() {
                            tracing::warn!("[{id}] Deleting plugin {}: {delete_err}", plugin.name());
                        }
                        return Err(err);
                    }
                }
            }
            _ => None,
        };
        Ok(Self {
            id,
            in_que,
            output,
            plugin: Mutex::new(plugin),
            stats: Mutex::new(LinkStatistics::default()),
        })
    }

    fn output_pools(
        sys: &SystemContext,
        id: LinkId,
        plugin: &str,
        out_info: &QueInfo,
        num_out_buffers: usize,
    ) -> Result<Vec<BufQue>> {
        let num_ch = out_info.channels.len();
        if num_ch == 0 || num_ch > MAX_CH_PER_QUE {
            return Err(Error::InvalidParams(format!(
                "{id}: plugin {plugin} declares {num_ch} output channels."
            )));
        }
        alloc_pools(sys.heap(), id, &out_info.channels, num_out_buffers, false)
    }

    /// Runs the plugin on one input. Returns the filled output, if any.
    fn run(
        &self,
        plugin: &mut dyn AlgorithmPlugin,
        stats: &mut LinkStatistics,
        input: &SystemBuffer,
    ) -> Option<SystemBuffer> {
        let ch = input.ch_num;
        let Some(output) = &self.output else {
            match plugin.process(input, None) {
                Ok(()) => stats.ch(0, ch).process += 1,
                Err(err) => {
                    stats.bump("process_errors", 1);
                    tracing::warn!("[{}] {} failed on channel {ch}: {err}", self.id, plugin.name());
                }
            }
            return None;
        };
        let Some(pool) = output.pools.get(ch as usize) else {
            stats.in_buf_error_count += 1;
            return None;
        };
        let Ok(mut out) = pool.get_empty(Timeout::NoWait) else {
            stats.ch(0, ch).drop += 1;
            return None;
        };
        out.ch_num = ch;
        out.src_timestamp = input.src_timestamp;
        match plugin.process(input, Some(&mut out)) {
            Ok(()) => {
                stats.ch(0, ch).process += 1;
                Some(out)
            }
            Err(err) => {
                stats.bump("process_errors", 1);
                tracing::warn!("[{}] {} failed on channel {ch}: {err}", self.id, plugin.name());
                if let Err(err) = pool.put_empty(out) {
                    tracing::warn!("[{}] Output buffer lost on channel {ch}: {err}", self.id);
                }
                None
            }
        }
    }

    fn pool_of(&self, buffer: &SystemBuffer) -> Option<&BufQue> {
        let output = self.output.as_ref()?;
        let index = buffer.id().index as usize / output.num_buffers;
        output.pools.get(index).filter(|pool| pool.owns(buffer))
    }
}

impl Link for AlgorithmLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        match &self.output {
            Some(output) => LinkInfo {
                queues: vec![output.info.clone()],
            },
            None => LinkInfo::default(),
        }
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let list = sys.get_links_full_buffers(self.in_que.prev_link_id, self.in_que.prev_link_que_id)?;
        if list.is_empty() {
            return Ok(());
        }
        let mut produced = 0;
        let mut inputs = Vec::with_capacity(list.len());
        {
            let mut plugin = self.plugin.lock();
            let mut stats = self.stats.lock();
            for mut input in list {
                input.stamp_arrival();
                stats.ch(0, input.ch_num).recv += 1;
                if let Some(out) = self.run(&mut **plugin, &mut stats, &input)
                    && let Some(pool) = self.pool_of(&out)
                {
                    let ch = out.ch_num;
                    if pool.put_full(out).is_ok() {
                        stats.ch(0, ch).out += 1;
                        produced += 1;
                    }
                }
                inputs.push(input);
            }
        }
        release_upstream(sys, self.id, &self.in_que, inputs);
        if produced > 0
            && let Some(output) = &self.output
        {
            sys.send_link_cmd(output.next_link, CMD_NEW_DATA)?;
        }
        Ok(())
    }

    fn control(&self, _sys: &SystemContext, cmd: &LinkCmd) -> Result<Vec<u8>> {
        self.plugin.lock().control(cmd)
    }

    fn stop(&self, _sys: &SystemContext) -> Result<()> {
        self.plugin.lock().stop()
    }

    fn get_full_buffers(&self, _sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        let output = self.output.as_ref().filter(|_| que_id == 0).ok_or_else(|| {
            Error::InvalidParams(format!("{} has no output queue {que_id}.", self.id))
        })?;
        let mut list = BufferList::new();
        for pool in &output.pools {
            pool.get_full_list(&mut list);
        }
        Ok(list)
    }

    fn put_empty_buffers(&self, _sys: &SystemContext, _que_id: u8, list: BufferList) -> Result<()> {
        for buffer in list {
            match self.pool_of(&buffer) {
                Some(pool) => pool.put_empty(buffer)?,
                None => {
                    self.stats.lock().in_buf_error_count += 1;
                    tracing::error!("[{}] Foreign buffer {} returned", self.id, buffer.id());
                }
            }
        }
        Ok(())
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        if let Some(output) = &self.output {
            free_pools(sys.heap(), &output.pools);
        }
        let mut plugin = self.plugin.lock();
        plugin.delete().inspect_err(|err| {
            tracing::warn!("[{}] Deleting plugin {}: {err}", self.id, plugin.name());
        })
    }

    fn statistics(&self) -> LinkStatistics {
        self.stats.lock().clone()
    }

    fn pending_buffers(&self) -> usize {
        self.output
            .as_ref()
            .map_or(0, |output| output.pools.iter().map(BufQue::held).sum())
    }
}
