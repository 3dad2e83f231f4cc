// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Runs a use case for a fixed time and reports what every link did.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use links::{
    LinkId, LinkStatistics, LinkType, Platform, links::endpoint::Endpoint, que::Timeout,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{PluginRegistry, Result, UseCase};

/// How long a sink drainer waits for a buffer before checking for stop.
const DRAIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkReport {
    pub id: LinkId,
    pub statistics: LinkStatistics,
}

/// Outcome of [`run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub usecase: String,
    pub platform_id: Uuid,
    pub chain_id: Uuid,
    pub elapsed_ms: u64,
    /// Buffers taken from each endpoint sink by the runner.
    pub delivered: BTreeMap<LinkId, u64>,
    /// Statistics of every link, producers first, sampled after stop.
    pub links: Vec<LinkReport>,
}

impl RunReport {
    pub fn link(&self, id: LinkId) -> Option<&LinkStatistics> {
        self.links
            .iter()
            .find(|link| link.id == id)
            .map(|link| &link.statistics)
    }
}

/// Brings up the use case on a fresh platform, runs it for `duration` and
/// tears it down again.
///
/// Endpoint sinks are drained by the runner, which returns every buffer at
/// once; endpoint sources are left idle.
///
/// # Errors
///
/// Any error building, creating or starting the chain. Errors while stopping
/// or deleting are logged and do not fail the run.
pub fn run(usecase: &UseCase, registry: &PluginRegistry, duration: Duration) -> Result<RunReport> {
    let platform = Platform::new(&usecase.procs(), usecase.config.clone())?;
    let mut chain = usecase.chain(registry)?;
    chain.create(&platform)?;

    let mut sinks: Vec<Endpoint> = Vec::new();
    for id in chain.link_ids() {
        if id.kind() != LinkType::Endpoint {
            continue;
        }
        let endpoint = platform.context(id.proc())?.endpoint(*id)?;
        if endpoint.is_sink() {
            sinks.push(endpoint);
        }
    }

    tracing::info!(
        "Running {} ({} links) for {} ms",
        usecase.name,
        chain.link_ids().len(),
        duration.as_millis()
    );
    let stop = AtomicBool::new(false);
    let counts: Vec<AtomicU64> = sinks.iter().map(|_| AtomicU64::new(0)).collect();
    let started = Instant::now();
    thread::scope(|scope| -> Result<()> {
        for (sink, count) in sinks.iter().zip(&counts) {
            let stop = &stop;
            scope.spawn(move || drain(sink, count, stop));
        }
        let result = chain.start();
        if result.is_ok() {
            thread::sleep(duration);
            if let Err(err) = chain.stop() {
                tracing::warn!("Stopping {} failed: {err}", usecase.name);
            }
        }
        stop.store(true, Ordering::Release);
        Ok(result?)
    })?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let links = chain
        .statistics()?
        .into_iter()
        .map(|(id, statistics)| LinkReport { id, statistics })
        .collect();
    let delivered = sinks
        .iter()
        .zip(&counts)
        .map(|(sink, count)| (sink.id(), count.load(Ordering::Acquire)))
        .collect();
    let report = RunReport {
        usecase: usecase.name.clone(),
        platform_id: platform.id(),
        chain_id: chain.id(),
        elapsed_ms,
        delivered,
        links,
    };
    if let Err(err) = chain.delete() {
        tracing::warn!("Deleting {} failed: {err}", usecase.name);
    }
    Ok(report)
}

fn drain(sink: &Endpoint, count: &AtomicU64, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        match sink.get_full(Timeout::After(DRAIN_POLL)) {
            Ok(buffer) => {
                count.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = sink.put_empty(buffer) {
                    tracing::error!("[{}] Returning a buffer failed: {err}", sink.id());
                }
            }
            Err(links::Error::Timeout | links::Error::NotReady) => {}
            Err(err) => {
                tracing::debug!("[{}] Drainer stopped: {err}", sink.id());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    const ENDPOINTS: &str = r#"{
        "name": "endpoint_pair",
        "config": { "drain_timeout_ms": 50 },
        "links": [
            { "id": "IPU1_0/EP_0", "params": { "role": "source", "out_que": { "next_link": "IPU1_0/EP_1" },
                "channels": [{ "buf_type": "bitstream", "format": "raw", "width": 64, "height": 1, "pitch": [64, 0] }] } },
            { "id": "IPU1_0/EP_1", "params": { "role": "sink", "in_que": { "prev_link_id": "IPU1_0/EP_0" } } }
        ]
    }"#;

    #[test]
    #[traced_test]
    fn idle_sources_run_and_report() {
        let usecase = UseCase::from_json_str(ENDPOINTS).unwrap();
        let report = run(&usecase, &PluginRegistry::default(), Duration::from_millis(30)).unwrap();
        let sink: LinkId = "IPU1_0/EP_1".parse().unwrap();
        assert_eq!(report.delivered.get(&sink), Some(&0));
        assert_eq!(report.links.len(), 2);
        assert!(report.elapsed_ms >= 30);
        assert!(logs_contain("Running endpoint_pair (2 links)"));
    }
}
