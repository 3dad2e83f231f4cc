// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for chains spanning processors and for the sink links.
//!
//! # Test Coverage
//!
//! - Frames crossing an IPC-Out/IPC-In pair in order and coming home
//! - Direct edges between processors being refused
//! - Shared heap left empty by a create that runs out of memory
//! - Remote link control through the notify bus
//! - Memory dumps of a Null link
//! - Frame snapshots of a Save link

mod common;

use common::{WAIT, in_que, link, out_que, setup_test, sink, source, wait_until};
use links::{
    ChainBuilder, Error, LinkType, Platform, ProcId,
    config::SystemConfig,
    buffer::BufferType,
    link::{ChInfo, DataFormat, LinkCmd},
    links::{
        LinkCreateParams,
        gate::{GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT, GateForwardCount, GateLinkParams, GateStatus},
        ipc_in::IpcInLinkParams,
        ipc_out::IpcOutLinkParams,
        null::{DumpMode, NULL_LINK_CMD_GET_DUMP, NullLinkParams},
        null_src::{NullSrcLinkParams, frame_marker},
        save::{SAVE_LINK_CMD_GET_SAVED_FRAME, SAVE_LINK_CMD_SAVE_FRAME, SaveFrameRequest, SaveLinkParams, SavedFrame},
    },
    que::Timeout,
};

const HOST: ProcId = ProcId::Ipu1_0;
const DSP: ProcId = ProcId::Dsp1;

fn null_src(next: links::LinkId, channels: Vec<ChInfo>, max_frames: Option<u64>) -> LinkCreateParams {
    LinkCreateParams::NullSrc(NullSrcLinkParams {
        out_que: out_que(next),
        channels,
        num_buffers_per_ch: 4,
        interval_ms: 2,
        max_frames,
    })
}

/// Frames produced on one processor arrive on another in order, and every
/// frame is released back to its producer once consumed.
#[test]
fn frames_cross_processors_in_order() {
    let platform = setup_test(&[HOST, DSP]);
    let src = link(HOST, LinkType::NullSrc, 0);
    let ipc_out = link(HOST, LinkType::IpcOut, 0);
    let ipc_in = link(DSP, LinkType::IpcIn, 0);
    let out = link(DSP, LinkType::Endpoint, 0);

    let mut chain = ChainBuilder::new()
        .add_link(out, sink(ipc_in, 0))
        .add_link(
            ipc_in,
            LinkCreateParams::IpcIn(IpcInLinkParams {
                in_que: in_que(ipc_out, 0),
                out_que: out_que(out),
            }),
        )
        .add_link(
            ipc_out,
            LinkCreateParams::IpcOut(IpcOutLinkParams {
                in_que: in_que(src, 0),
                out_que: out_que(ipc_in),
                num_elements: Some(8),
            }),
        )
        .add_link(
            src,
            null_src(ipc_out, vec![ChInfo::video(DataFormat::Yuv420Sp, 32, 8)], Some(20)),
        )
        .build()
        .unwrap();
    assert_eq!(chain.link_ids(), &[src, ipc_out, ipc_in, out]);
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let dsp = platform.context(DSP).unwrap();
    let consumer = dsp.endpoint(out).unwrap();
    for frame in 0..20u32 {
        let buffer = consumer.get_full(Timeout::After(WAIT)).unwrap();
        assert_eq!(buffer.buf_type(), BufferType::VideoFrame);
        assert_eq!(frame_marker(&buffer), Some((frame, 0)));
        assert_eq!(buffer.video_frame().unwrap().info.width, 32);
        consumer.put_empty(buffer).unwrap();
    }

    assert!(wait_until(WAIT, || chain.pending_buffers() == 0));
    let host = platform.context(HOST).unwrap();
    let sent = host.link_statistics(ipc_out).unwrap();
    assert_eq!(sent.total_out(), 20);
    assert_eq!(sent.counter("slots_in_use"), 0);
    assert_eq!(dsp.link_statistics(ipc_in).unwrap().counter("unreturned"), 0);
    chain.delete().unwrap();
    assert!(host.link_ids().is_empty());
    assert!(dsp.link_ids().is_empty());
}

/// A link reading straight from another processor is refused, both when the
/// chain is built and when it is created on its own.
#[test]
fn direct_cross_processor_edges_are_refused() {
    let platform = setup_test(&[HOST, DSP]);
    let src = link(HOST, LinkType::NullSrc, 0);
    let out = link(DSP, LinkType::Null, 0);
    let meta = vec![ChInfo::opaque(BufferType::MetaData, 16)];
    let null = || {
        LinkCreateParams::Null(NullLinkParams {
            in_queues: vec![in_que(src, 0)],
            dump: DumpMode::None,
        })
    };

    let result = ChainBuilder::new()
        .add_link(src, null_src(out, meta.clone(), None))
        .add_link(out, null())
        .build();
    assert!(matches!(result, Err(Error::Graph(_))));

    let mut producer = ChainBuilder::new()
        .add_link(src, null_src(out, meta, None))
        .build()
        .unwrap();
    producer.create(&platform).unwrap();
    let dsp = platform.context(DSP).unwrap();
    assert!(matches!(
        dsp.create_link(out, null()),
        Err(Error::InvalidParams(_))
    ));
    assert!(!dsp.contains(out));
    producer.delete().unwrap();
}

/// A chain whose pools do not fit the shared heap fails to create and gives
/// back every block it had already taken.
#[test]
fn failed_create_leaves_the_heap_empty() {
    setup_test(&[HOST]);
    let config = SystemConfig {
        shared_heap_bytes: 100,
        drain_timeout_ms: 50,
        ..SystemConfig::default()
    };
    let platform = Platform::new(&[HOST], config).unwrap();
    let src = link(HOST, LinkType::Endpoint, 0);
    let out = link(HOST, LinkType::Endpoint, 1);

    let mut chain = ChainBuilder::new()
        .add_link(src, source(out, vec![ChInfo::opaque(BufferType::MetaData, 16)], 10))
        .add_link(out, sink(src, 0))
        .build()
        .unwrap();
    assert!(matches!(chain.create(&platform), Err(Error::Alloc(_))));
    assert_eq!(platform.heap().block_count(), 0);
    assert_eq!(platform.heap().used(), 0);
    assert!(platform.context(HOST).unwrap().link_ids().is_empty());
}

/// Control commands reach a link on another processor and carry the reply
/// back.
#[test]
fn link_control_reaches_remote_processor() {
    let platform = setup_test(&[HOST, DSP]);
    let src = link(DSP, LinkType::NullSrc, 0);
    let gate = link(DSP, LinkType::Gate, 0);
    let out = link(DSP, LinkType::Null, 0);

    let mut chain = ChainBuilder::new()
        .add_link(src, null_src(gate, vec![ChInfo::opaque(BufferType::MetaData, 16)], None))
        .add_link(
            gate,
            LinkCreateParams::Gate(GateLinkParams {
                in_que: in_que(src, 0),
                out_que: out_que(out),
                prev_link_is_created: true,
                prev_link_info: None,
            }),
        )
        .add_link(
            out,
            LinkCreateParams::Null(NullLinkParams {
                in_queues: vec![in_que(gate, 0)],
                dump: DumpMode::None,
            }),
        )
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let host = platform.context(HOST).unwrap();
    let reply = host
        .link_control(gate, LinkCmd::new(GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT))
        .unwrap();
    let count: GateForwardCount = serde_json::from_slice(&reply).unwrap();
    assert_eq!(count.status, GateStatus::Off);
    assert!(matches!(
        host.link_control(gate, LinkCmd::new(0x1234)),
        Err(Error::UnsupportedCmd(0x1234))
    ));
    chain.delete().unwrap();
}

/// A Null link in memory dump mode keeps the payload of every frame it
/// received, up to its limit.
#[test]
fn null_link_dumps_payloads_to_memory() {
    let platform = setup_test(&[HOST]);
    let src = link(HOST, LinkType::NullSrc, 0);
    let out = link(HOST, LinkType::Null, 0);

    let mut chain = ChainBuilder::new()
        .add_link(src, null_src(out, vec![ChInfo::opaque(BufferType::MetaData, 16)], Some(3)))
        .add_link(
            out,
            LinkCreateParams::Null(NullLinkParams {
                in_queues: vec![in_que(src, 0)],
                dump: DumpMode::Memory { max_bytes: 1024 },
            }),
        )
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(HOST).unwrap();
    assert!(wait_until(WAIT, || {
        sys.link_statistics(out).unwrap().total_recv() == 3
    }));
    let dump = sys
        .link_control(out, LinkCmd::new(NULL_LINK_CMD_GET_DUMP))
        .unwrap();
    assert_eq!(dump.len(), 48);
    for (frame, chunk) in dump.chunks(16).enumerate() {
        assert_eq!(chunk[0..4], (frame as u32).to_le_bytes());
    }
    assert!(wait_until(WAIT, || chain.pending_buffers() == 0));
    chain.delete().unwrap();
}

/// A Save link captures the next frame of the requested channel once armed.
#[test]
fn save_link_snapshots_a_frame() {
    let platform = setup_test(&[HOST]);
    let src = link(HOST, LinkType::NullSrc, 0);
    let save = link(HOST, LinkType::Save, 0);
    let meta = ChInfo::opaque(BufferType::MetaData, 16);

    let mut chain = ChainBuilder::new()
        .add_link(src, null_src(save, vec![meta, meta], None))
        .add_link(
            save,
            LinkCreateParams::Save(SaveLinkParams {
                in_que: in_que(src, 0),
            }),
        )
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(HOST).unwrap();
    assert!(matches!(
        sys.link_control(save, LinkCmd::new(SAVE_LINK_CMD_GET_SAVED_FRAME)),
        Err(Error::NotReady)
    ));
    let request = SaveFrameRequest { ch: Some(1) };
    sys.link_control(
        save,
        LinkCmd::with_params(SAVE_LINK_CMD_SAVE_FRAME, &request).unwrap(),
    )
    .unwrap();

    let mut saved = None;
    assert!(wait_until(WAIT, || {
        saved = sys
            .link_control(save, LinkCmd::new(SAVE_LINK_CMD_GET_SAVED_FRAME))
            .ok();
        saved.is_some()
    }));
    let saved: SavedFrame = serde_json::from_slice(&saved.unwrap()).unwrap();
    assert_eq!(saved.ch_num, 1);
    assert_eq!(saved.buf_type, BufferType::MetaData);
    assert_eq!(saved.data.len(), 16);
    assert_eq!(saved.data[4..8], 1u32.to_le_bytes());
    chain.delete().unwrap();
}
