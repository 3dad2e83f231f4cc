// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use links::{
    LinkId, LinkType, Platform, ProcId,
    config::SystemConfig,
    link::{ChInfo, InQueParams, OutQueParams},
    links::{LinkCreateParams, endpoint::EndpointLinkParams},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

pub const WAIT: Duration = Duration::from_secs(2);

/// Initializes logging and brings up a platform with a short drain timeout.
pub fn setup_test(procs: &[ProcId]) -> Platform {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    });
    let config = SystemConfig {
        drain_timeout_ms: 200,
        ..SystemConfig::default()
    };
    Platform::new(procs, config).unwrap()
}

pub fn link(proc: ProcId, kind: LinkType, instance: u8) -> LinkId {
    LinkId::new(proc, kind, instance).unwrap()
}

pub fn in_que(prev: LinkId, que: u8) -> InQueParams {
    InQueParams {
        prev_link_id: prev,
        prev_link_que_id: que,
    }
}

pub fn out_que(next: LinkId) -> OutQueParams {
    OutQueParams { next_link: next }
}

pub fn sink(prev: LinkId, que: u8) -> LinkCreateParams {
    LinkCreateParams::Endpoint(EndpointLinkParams::Sink {
        in_que: in_que(prev, que),
    })
}

pub fn source(next: LinkId, channels: Vec<ChInfo>, num_buffers: usize) -> LinkCreateParams {
    LinkCreateParams::Endpoint(EndpointLinkParams::Source {
        out_que: out_que(next),
        channels,
        num_buffers,
    })
}

/// Polls `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
