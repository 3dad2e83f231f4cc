// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Chain orchestration: bringing a set of links up and down in dependency
//! order.
//!
//! Edges come from each link's input queues. Producers are created first
//! and started last, so every consumer is ready before data flows; stop
//! mirrors that, and delete runs consumers first once in-flight buffers have
//! come home.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use petgraph::{algo::toposort, graph::DiGraph};
use uuid::Uuid;

use crate::{
    Error, Result, SystemContext,
    link::LinkStatistics,
    link_id::{LinkId, LinkType},
    links::LinkCreateParams,
    platform::Platform,
};

const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Collects the links of a chain.
///
/// # Examples
///
/// ```
/// use links::{ChainBuilder, Error, LinkId, LinkType, ProcId};
/// use links::link::{InQueParams, OutQueParams};
/// use links::links::{LinkCreateParams, dup::DupLinkParams};
///
/// let a = LinkId::new(ProcId::Ipu1_0, LinkType::Dup, 0).unwrap();
/// let b = LinkId::new(ProcId::Ipu1_0, LinkType::Dup, 1).unwrap();
/// let dup = |prev, next| {
///     LinkCreateParams::Dup(DupLinkParams {
///         in_que: InQueParams { prev_link_id: prev, prev_link_que_id: 0 },
///         out_queues: vec![OutQueParams { next_link: next }],
///         notify_next_link: true,
///     })
/// };
/// let result = ChainBuilder::new()
///     .add_link(a, dup(b, b))
///     .add_link(b, dup(a, a))
///     .build();
/// assert!(matches!(result, Err(Error::Graph(_))));
/// ```
#[derive(Default)]
pub struct ChainBuilder {
    links: Vec<(LinkId, LinkCreateParams)>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(mut self, id: LinkId, params: LinkCreateParams) -> Self {
        self.links.push((id, params));
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Checks the topology and fixes the creation order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Graph`] for an empty chain, a repeated link id, a
    /// cycle, or a link other than IPC-In reading from another processor.
    pub fn build(self) -> Result<Chain> {
        if self.links.is_empty() {
            return Err(Error::Graph("A chain needs at least one link.".into()));
        }
        let mut graph = DiGraph::<LinkId, ()>::new();
        let mut nodes = HashMap::new();
        for (id, params) in &self.links {
            if params.kind() != id.kind() {
                return Err(Error::Graph(format!(
                    "{id} is given {} parameters.",
                    params.kind()
                )));
            }
            if nodes.insert(*id, graph.add_node(*id)).is_some() {
                return Err(Error::Graph(format!("{id} appears twice.")));
            }
            if id.kind() != LinkType::IpcIn
                && let Some(prev) = params
                    .sources()
                    .into_iter()
                    .map(|in_que| in_que.prev_link_id)
                    .find(|prev| prev.proc() != id.proc())
            {
                return Err(Error::Graph(format!(
                    "{id} reads from {prev} on another processor without an IPC link."
                )));
            }
        }
        let mut external = Vec::new();
        for (id, params) in &self.links {
            let to = nodes[id];
            for in_que in params.input_queues() {
                let prev = in_que.prev_link_id;
                match nodes.get(&prev) {
                    Some(&from) => {
                        graph.update_edge(from, to, ());
                    }
                    None if !external.contains(&prev) => external.push(prev),
                    None => {}
                }
            }
        }
        let sorted = toposort(&graph, None).map_err(|cycle| {
            Error::Graph(format!("Cycle through {}.", graph[cycle.node_id()]))
        })?;

        let mut params: HashMap<LinkId, LinkCreateParams> = self.links.into_iter().collect();
        let mut planned = Vec::with_capacity(sorted.len());
        for node in sorted {
            let id = graph[node];
            if let Some(p) = params.remove(&id) {
                planned.push((id, p));
            }
        }
        let id = Uuid::new_v4();
        tracing::debug!("Chain {id}: {} links, {} external inputs", planned.len(), external.len());
        Ok(Chain {
            id,
            order: planned.iter().map(|(id, _)| *id).collect(),
            planned,
            external,
            created: Vec::new(),
            state: ChainState::Built,
            drain_timeout: Duration::ZERO,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Built,
    Created,
    Running,
    Stopped,
    Deleted,
}

/// A validated set of links, brought up and down as a unit.
pub struct Chain {
    id: Uuid,
    /// Topological order: every producer before its consumers.
    order: Vec<LinkId>,
    planned: Vec<(LinkId, LinkCreateParams)>,
    /// Links read from but not part of the chain.
    external: Vec<LinkId>,
    created: Vec<(LinkId, Arc<SystemContext>)>,
    state: ChainState,
    drain_timeout: Duration,
}

impl Chain {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Link ids, producers first.
    pub fn link_ids(&self) -> &[LinkId] {
        &self.order
    }

    /// Creates every link on its processor, producers first. On failure the
    /// links created so far are deleted again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Graph`] if a link reads from one that is neither in
    /// the chain nor already created, and otherwise the first create error.
    pub fn create(&mut self, platform: &Platform) -> Result<()> {
        self.expect_state(&[ChainState::Built], "create")?;
        for prev in &self.external {
            if !platform.context(prev.proc())?.contains(*prev) {
                return Err(Error::Graph(format!(
                    "{prev} is read from but neither in the chain nor created."
                )));
            }
        }
        self.drain_timeout = platform.config().drain_timeout();
        for (id, params) in std::mem::take(&mut self.planned) {
            let created = platform
                .context(id.proc())
                .and_then(|sys| sys.create_link(id, params).map(|()| sys));
            match created {
                Ok(sys) => self.created.push((id, sys)),
                Err(err) => {
                    tracing::error!("Chain {}: creating {id} failed: {err}", self.id);
                    if let Err(cleanup) = self.delete_created() {
                        tracing::warn!("Chain {}: cleanup after failed create: {cleanup}", self.id);
                    }
                    self.state = ChainState::Deleted;
                    return Err(err);
                }
            }
        }
        self.state = ChainState::Created;
        tracing::info!("Chain {} created with {} links", self.id, self.created.len());
        Ok(())
    }

    /// Starts the links, consumers first.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(&[ChainState::Created, ChainState::Stopped], "start")?;
        for (id, sys) in self.created.iter().rev() {
            if let Err(err) = sys.start_link(*id) {
                tracing::error!("Chain {}: starting {id} failed: {err}", self.id);
                if let Err(cleanup) = self.stop_all() {
                    tracing::warn!("Chain {}: cleanup after failed start: {cleanup}", self.id);
                }
                self.state = ChainState::Stopped;
                return Err(err);
            }
        }
        self.state = ChainState::Running;
        tracing::info!("Chain {} running", self.id);
        Ok(())
    }

    /// Stops the links, producers first.
    pub fn stop(&mut self) -> Result<()> {
        self.expect_state(&[ChainState::Running], "stop")?;
        let result = self.stop_all();
        self.state = ChainState::Stopped;
        tracing::info!("Chain {} stopped", self.id);
        result
    }

    /// Stops the chain if running, waits for in-flight buffers to come home
    /// and deletes the links, consumers first.
    ///
    /// Links still holding buffers once the drain timeout expires are
    /// deleted anyway; the count is logged.
    pub fn delete(&mut self) -> Result<()> {
        match self.state {
            ChainState::Deleted => return Ok(()),
            ChainState::Built => {
                self.state = ChainState::Deleted;
                return Ok(());
            }
            ChainState::Running => {
                if let Err(err) = self.stop_all() {
                    tracing::warn!("Chain {}: stopping before delete: {err}", self.id);
                }
            }
            ChainState::Created | ChainState::Stopped => {}
        }
        let pending = self.drain();
        if pending > 0 {
            tracing::warn!(
                "Chain {}: deleting with {pending} buffers still in flight",
                self.id
            );
        }
        let result = self.delete_created();
        self.state = ChainState::Deleted;
        tracing::info!("Chain {} deleted", self.id);
        result
    }

    /// Statistics of every created link, producers first.
    pub fn statistics(&self) -> Result<Vec<(LinkId, LinkStatistics)>> {
        self.created
            .iter()
            .map(|(id, sys)| Ok((*id, sys.link_statistics(*id)?)))
            .collect()
    }

    /// Buffers handed downstream and not yet returned, summed over the
    /// chain.
    pub fn pending_buffers(&self) -> usize {
        self.created
            .iter()
            .filter_map(|(id, sys)| sys.pending_buffers(*id).ok())
            .sum()
    }

    fn drain(&self) -> usize {
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            let pending = self.pending_buffers();
            if pending == 0 || Instant::now() >= deadline {
                return pending;
            }
            std::thread::sleep(DRAIN_POLL);
        }
    }

    fn stop_all(&self) -> Result<()> {
        let mut first_err = None;
        for (id, sys) in &self.created {
            if let Err(err) = sys.stop_link(*id) {
                tracing::error!("Chain {}: stopping {id} failed: {err}", self.id);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn delete_created(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some((id, sys)) = self.created.pop() {
            if !sys.contains(id) {
                continue;
            }
            if let Err(err) = sys.delete_link(id) {
                tracing::error!("Chain {}: deleting {id} failed: {err}", self.id);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn expect_state(&self, allowed: &[ChainState], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "Chain {} cannot {op} while {:?}.",
                self.id, self.state
            )))
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        if let Err(err) = self.delete() {
            tracing::error!("Chain {} delete on drop failed: {err}", self.id);
        }
    }
}
