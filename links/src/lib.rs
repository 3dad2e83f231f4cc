// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! # Links
//!
//! A dataflow engine for multi-processor video pipelines. Each processing
//! stage is a *link* driven by its own task; links are wired into a *chain*
//! by naming, for every input queue, the link and output queue it reads
//! from.
//!
//! ## Overview
//!
//! Links never call each other directly. A producer that has filled buffers
//! posts `NEW_DATA` to its consumer, the consumer pulls the buffers with
//! [`SystemContext::get_links_full_buffers`] and, once done, hands them back
//! with [`SystemContext::put_links_empty_buffers`]. Buffers move by value, so
//! at any instant exactly one queue or link holds each of them.
//!
//! ### Key Concepts
//!
//! - **Link id**: processor, link type and instance packed into 32 bits ([`LinkId`])
//! - **System buffer**: descriptor of one frame, bitstream or metadata block ([`buffer::SystemBuffer`])
//! - **Buffer queue**: an empty/full queue pair over a buffer pool ([`BufQue`])
//! - **IPC ring**: single-writer/single-reader ring in shared memory ([`ipc_que`])
//! - **Notify**: a 4-byte message that wakes a link on another processor ([`notify`])
//! - **System context**: the link registry of one processor ([`SystemContext`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐
//! │ Platform │  SharedHeap, NotifyBus, IPC ring directory
//! └────┬─────┘
//!      │
//!      ├─► SystemContext (IPU1_0) ──► link tasks ──► Dup, Merge, NullSrc, ...
//!      │                                   │
//!      │                              IpcOut ══ ring ══╗
//!      │                                               ║ notify
//!      └─► SystemContext (DSP1)   ──► link tasks ──► IpcIn ──► Alg ──► ...
//! ```
//!
//! ## Examples
//!
//! ### A source feeding an application sink
//!
//! ```
//! use std::time::Duration;
//! use links::{ChainBuilder, LinkId, LinkType, Platform, ProcId, config::SystemConfig};
//! use links::link::{ChInfo, DataFormat, InQueParams, OutQueParams};
//! use links::links::{LinkCreateParams, endpoint::EndpointLinkParams, null_src::NullSrcLinkParams};
//! use links::que::Timeout;
//!
//! # fn main() -> Result<(), links::Error> {
//! let platform = Platform::new(&[ProcId::Ipu1_0], SystemConfig::default())?;
//! let src = LinkId::new(ProcId::Ipu1_0, LinkType::NullSrc, 0)?;
//! let sink = LinkId::new(ProcId::Ipu1_0, LinkType::Endpoint, 0)?;
//!
//! let mut chain = ChainBuilder::new()
//!     .add_link(src, LinkCreateParams::NullSrc(NullSrcLinkParams {
//!         out_que: OutQueParams { next_link: sink },
//!         channels: vec![ChInfo::video(DataFormat::Yuv420Sp, 64, 32)],
//!         num_buffers_per_ch: 4,
//!         interval_ms: 5,
//!         max_frames: Some(3),
//!     }))
//!     .add_link(sink, LinkCreateParams::Endpoint(EndpointLinkParams::Sink {
//!         in_que: InQueParams { prev_link_id: src, prev_link_que_id: 0 },
//!     }))
//!     .build()?;
//! chain.create(&platform)?;
//! chain.start()?;
//!
//! let endpoint = platform.context(ProcId::Ipu1_0)?.endpoint(sink)?;
//! for _ in 0..3 {
//!     let buffer = endpoint.get_full(Timeout::After(Duration::from_secs(1)))?;
//!     endpoint.put_empty(buffer)?;
//! }
//! chain.delete()?;
//! # Ok(())
//! # }
//! ```

pub mod buf_que;
pub mod buffer;
pub mod chain;
pub mod config;
pub mod error;
pub mod ipc_que;
pub mod link;
pub mod link_id;
pub mod links;
pub mod net_ctrl;
pub mod notify;
pub mod platform;
pub mod que;
pub mod shared_mem;
pub mod system;
mod task;

pub use buf_que::BufQue;
pub use chain::{Chain, ChainBuilder, ChainState};
pub use error::{Error, Result, TransportError};
pub use link::{Link, LinkCmd, LinkInfo, LinkState, LinkStatistics};
pub use link_id::{LinkId, LinkType, ProcId};
pub use net_ctrl::{NetworkCtrl, NetworkCtrlAck};
pub use platform::Platform;
pub use shared_mem::SharedHeap;
pub use system::SystemContext;
