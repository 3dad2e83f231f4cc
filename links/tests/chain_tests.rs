// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for chains running on a single processor.
//!
//! Each test brings up its own [`Platform`], wires endpoint links to the
//! link under test and drives buffers through it from the test threads.
//!
//! # Test Coverage
//!
//! - Fan-out, fan-in and routing (Dup, Merge, Select)
//! - Frame grouping and strip cutting (Sync, Split)
//! - Runtime gating and remote control
//! - Algorithm output pools freed when the plugin fails to delete
//! - Backpressure on a source pool
//! - Topology validation and chain lifecycle

mod common;

use std::{thread, time::Duration};

use common::{WAIT, in_que, link, out_que, setup_test, sink, source, wait_until};
use links::{
    ChainBuilder, ChainState, Error, LinkType, ProcId,
    buffer::{BufferType, Payload, SystemBuffer},
    error::status,
    link::{ChInfo, DataFormat, LinkCmd, QueInfo},
    links::{
        LinkCreateParams,
        algorithm::{AlgorithmLinkParams, AlgorithmPlugin},
        dup::DupLinkParams,
        gate::{
            GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT, GATE_LINK_CMD_SET_OPERATION_MODE_OFF,
            GATE_LINK_CMD_SET_OPERATION_MODE_ON, GateForwardCount, GateLinkParams, GateStatus,
        },
        merge::MergeLinkParams,
        select::{
            SELECT_LINK_CMD_GET_OUT_QUE_CH_INFO, SELECT_LINK_CMD_SET_OUT_QUE_CH_INFO,
            OutQueChInfo, SelectLinkParams, SelectOutQue,
        },
        split::SplitLinkParams,
        sync::{SYNC_DROP_THRESHOLD_MAX, SyncLinkParams},
    },
    net_ctrl::{LinkControlRequest, NETWORK_CTRL_CMD_LINK_CONTROL, NetworkCtrl},
    que::Timeout,
    shared_mem::SharedHeap,
};
use tracing::info;

const P: ProcId = ProcId::Ipu1_0;

fn meta() -> ChInfo {
    ChInfo::opaque(BufferType::MetaData, 16)
}

/// A duplicated stream reaches both consumers complete and in order, and
/// every original goes home once both copies are returned.
#[test]
fn dup_delivers_every_buffer_to_every_consumer() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let dup = link(P, LinkType::Dup, 0);
    let sink_a = link(P, LinkType::Endpoint, 1);
    let sink_b = link(P, LinkType::Endpoint, 2);

    let mut chain = ChainBuilder::new()
        .add_link(sink_a, sink(dup, 0))
        .add_link(sink_b, sink(dup, 1))
        .add_link(
            dup,
            LinkCreateParams::Dup(DupLinkParams {
                in_que: in_que(src, 0),
                out_queues: vec![out_que(sink_a), out_que(sink_b)],
                notify_next_link: true,
            }),
        )
        .add_link(src, source(dup, vec![meta()], 4))
        .build()
        .unwrap();
    assert_eq!(chain.link_ids()[0], src);
    chain.create(&platform).unwrap();
    chain.start().unwrap();
    assert_eq!(chain.state(), ChainState::Running);

    let sys = platform.context(P).unwrap();
    let producer = sys.endpoint(src).unwrap();
    let consumers: Vec<_> = [sink_a, sink_b]
        .into_iter()
        .map(|id| {
            let endpoint = sys.endpoint(id).unwrap();
            thread::spawn(move || {
                for i in 0..100u64 {
                    let buffer = endpoint.get_full(Timeout::After(WAIT)).unwrap();
                    assert_eq!(buffer.src_timestamp, i + 1);
                    endpoint.put_empty(buffer).unwrap();
                }
            })
        })
        .collect();

    for i in 0..100u64 {
        let mut buffer = producer.get_empty(0, Timeout::After(WAIT)).unwrap();
        buffer.src_timestamp = i + 1;
        producer.put_full(buffer).unwrap();
    }
    for consumer in consumers {
        consumer.join().unwrap();
    }

    assert!(wait_until(WAIT, || chain.pending_buffers() == 0));
    let stats = sys.link_statistics(dup).unwrap();
    assert_eq!(stats.counter("held_originals"), 0);
    assert_eq!(stats.total_recv(), 100);
    info!("Dup statistics: {stats:?}");
    chain.delete().unwrap();
    assert_eq!(chain.state(), ChainState::Deleted);
}

/// A Dup output whose consumer was never created does not keep the other
/// consumers from hearing about new data.
#[test]
fn dup_notifies_past_a_missing_consumer() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let dup = link(P, LinkType::Dup, 0);
    let missing = link(P, LinkType::Null, 3);
    let out = link(P, LinkType::Endpoint, 1);

    let mut chain = ChainBuilder::new()
        .add_link(src, source(dup, vec![meta()], 4))
        .add_link(
            dup,
            LinkCreateParams::Dup(DupLinkParams {
                in_que: in_que(src, 0),
                out_queues: vec![out_que(missing), out_que(out)],
                notify_next_link: true,
            }),
        )
        .add_link(out, sink(dup, 1))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(P).unwrap();
    let producer = sys.endpoint(src).unwrap();
    let consumer = sys.endpoint(out).unwrap();
    for i in 0..3u64 {
        let mut buffer = producer.get_empty(0, Timeout::After(WAIT)).unwrap();
        buffer.src_timestamp = i + 1;
        producer.put_full(buffer).unwrap();
    }
    for i in 0..3u64 {
        let buffer = consumer.get_full(Timeout::After(WAIT)).unwrap();
        assert_eq!(buffer.src_timestamp, i + 1);
        consumer.put_empty(buffer).unwrap();
    }
    assert!(!sys.contains(missing));
    chain.delete().unwrap();
}

/// Merged channels keep their per-input order and can be traced back to
/// the input they came from.
#[test]
fn merge_numbers_channels_by_input() {
    let platform = setup_test(&[P]);
    let sources: Vec<_> = (0..3).map(|i| link(P, LinkType::Endpoint, i)).collect();
    let merge = link(P, LinkType::Merge, 0);
    let out = link(P, LinkType::Endpoint, 3);

    let mut builder = ChainBuilder::new();
    for src in &sources {
        builder = builder.add_link(*src, source(merge, vec![meta()], 4));
    }
    let mut chain = builder
        .add_link(
            merge,
            LinkCreateParams::Merge(MergeLinkParams {
                in_queues: sources.iter().map(|src| in_que(*src, 0)).collect(),
                out_que: out_que(out),
                notify_next_link: true,
            }),
        )
        .add_link(out, sink(merge, 0))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(P).unwrap();
    assert_eq!(sys.link_get_info(merge).unwrap().queues[0].channels.len(), 3);
    let producers: Vec<_> = sources
        .iter()
        .enumerate()
        .map(|(q, src)| {
            let endpoint = sys.endpoint(*src).unwrap();
            thread::spawn(move || {
                for i in 0..10u64 {
                    let mut buffer = endpoint.get_empty(0, Timeout::After(WAIT)).unwrap();
                    buffer.src_timestamp = q as u64 * 1000 + i + 1;
                    endpoint.put_full(buffer).unwrap();
                }
            })
        })
        .collect();

    let consumer = sys.endpoint(out).unwrap();
    let mut next = [1u64; 3];
    for _ in 0..30 {
        let buffer = consumer.get_full(Timeout::After(WAIT)).unwrap();
        let q = buffer.ch_num as usize;
        assert!(q < 3, "unexpected output channel {q}");
        assert_eq!(buffer.src_timestamp, q as u64 * 1000 + next[q]);
        next[q] += 1;
        consumer.put_empty(buffer).unwrap();
    }
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(next, [11; 3]);
    assert!(wait_until(WAIT, || chain.pending_buffers() == 0));
    chain.delete().unwrap();
}

/// Channels are routed per the selection, unselected ones go straight back
/// to the producer, and the selection can be changed while running.
#[test]
fn select_routes_and_reroutes_channels() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let select = link(P, LinkType::Select, 0);
    let sink_a = link(P, LinkType::Endpoint, 1);
    let sink_b = link(P, LinkType::Endpoint, 2);

    let mut chain = ChainBuilder::new()
        .add_link(src, source(select, vec![meta(); 3], 2))
        .add_link(
            select,
            LinkCreateParams::Select(SelectLinkParams {
                in_que: in_que(src, 0),
                out_queues: vec![
                    SelectOutQue {
                        next_link: sink_a,
                        in_ch_nums: vec![0],
                    },
                    SelectOutQue {
                        next_link: sink_b,
                        in_ch_nums: vec![2],
                    },
                ],
                notify_next_link: true,
            }),
        )
        .add_link(sink_a, sink(select, 0))
        .add_link(sink_b, sink(select, 1))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(P).unwrap();
    let producer = sys.endpoint(src).unwrap();
    let (a, b) = (sys.endpoint(sink_a).unwrap(), sys.endpoint(sink_b).unwrap());
    for ch in 0..3 {
        let mut buffer = producer.get_empty(ch, Timeout::After(WAIT)).unwrap();
        buffer.src_timestamp = 100 + ch as u64;
        producer.put_full(buffer).unwrap();
    }

    let first = a.get_full(Timeout::After(WAIT)).unwrap();
    assert_eq!((first.ch_num, first.src_timestamp), (0, 100));
    let second = b.get_full(Timeout::After(WAIT)).unwrap();
    assert_eq!((second.ch_num, second.src_timestamp), (0, 102));
    assert!(wait_until(WAIT, || {
        sys.link_statistics(select).unwrap().total_drop() == 1
    }));
    a.put_empty(first).unwrap();
    b.put_empty(second).unwrap();

    let set = OutQueChInfo {
        out_que_id: 1,
        in_ch_nums: vec![1, 2],
    };
    sys.link_control(
        select,
        LinkCmd::with_params(SELECT_LINK_CMD_SET_OUT_QUE_CH_INFO, &set).unwrap(),
    )
    .unwrap();
    let query = OutQueChInfo {
        out_que_id: 1,
        in_ch_nums: Vec::new(),
    };
    let reply = sys
        .link_control(
            select,
            LinkCmd::with_params(SELECT_LINK_CMD_GET_OUT_QUE_CH_INFO, &query).unwrap(),
        )
        .unwrap();
    let got: OutQueChInfo = serde_json::from_slice(&reply).unwrap();
    assert_eq!(got, set);

    let mut buffer = producer.get_empty(1, Timeout::After(WAIT)).unwrap();
    buffer.src_timestamp = 201;
    producer.put_full(buffer).unwrap();
    let rerouted = b.get_full(Timeout::After(WAIT)).unwrap();
    assert_eq!((rerouted.ch_num, rerouted.src_timestamp), (0, 201));
    b.put_empty(rerouted).unwrap();

    let bad = OutQueChInfo {
        out_que_id: 0,
        in_ch_nums: vec![7],
    };
    assert!(matches!(
        sys.link_control(
            select,
            LinkCmd::with_params(SELECT_LINK_CMD_SET_OUT_QUE_CH_INFO, &bad).unwrap()
        ),
        Err(Error::InvalidParams(_))
    ));

    assert!(wait_until(WAIT, || chain.pending_buffers() == 0));
    chain.delete().unwrap();
}

/// Frames with matching capture times leave as one composite, and returning
/// the composite returns every frame in it.
#[test]
fn sync_groups_matching_frames() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let sync = link(P, LinkType::Sync, 0);
    let out = link(P, LinkType::Endpoint, 1);
    let video = ChInfo::video(DataFormat::Yuv422I, 32, 4);

    let mut chain = ChainBuilder::new()
        .add_link(src, source(sync, vec![video; 2], 4))
        .add_link(
            sync,
            LinkCreateParams::Sync(SyncLinkParams {
                in_que: in_que(src, 0),
                out_que: out_que(out),
                sync_delta_ms: 5,
                sync_threshold_ms: SYNC_DROP_THRESHOLD_MAX,
                num_out_buffers: 4,
                active_channels: None,
            }),
        )
        .add_link(out, sink(sync, 0))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(P).unwrap();
    let info = sys.link_get_info(sync).unwrap();
    assert_eq!(info.queues[0].channels.len(), 1);
    assert_eq!(
        info.queues[0].channels[0].buf_type,
        BufferType::VideoFrameContainer
    );

    let producer = sys.endpoint(src).unwrap();
    let consumer = sys.endpoint(out).unwrap();
    for k in 1..=3u64 {
        for ch in 0..2 {
            let mut buffer = producer.get_empty(ch, Timeout::After(WAIT)).unwrap();
            buffer.src_timestamp = k * 1_000_000;
            producer.put_full(buffer).unwrap();
        }
        let container = consumer.get_full(Timeout::After(WAIT)).unwrap();
        assert_eq!(container.src_timestamp, k * 1_000_000);
        let Payload::Composite(frames) = &container.payload else {
            panic!("expected a composite, got {:?}", container.buf_type());
        };
        let channels: Vec<u32> = frames.iter().map(|f| f.ch_num).collect();
        assert_eq!(channels, vec![0, 1]);
        consumer.put_empty(container).unwrap();
    }

    assert!(wait_until(WAIT, || chain.pending_buffers() == 0));
    assert_eq!(sys.link_statistics(sync).unwrap().counter("composites"), 3);
    chain.delete().unwrap();
}

/// Each frame is cut into strips that point into the original planes.
#[test]
fn split_cuts_frames_into_strips() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let split = link(P, LinkType::Split, 0);
    let out = link(P, LinkType::Endpoint, 1);

    let mut chain = ChainBuilder::new()
        .add_link(
            src,
            source(split, vec![ChInfo::video(DataFormat::Yuv422I, 64, 4)], 2),
        )
        .add_link(
            split,
            LinkCreateParams::Split(SplitLinkParams {
                in_que: in_que(src, 0),
                out_que: out_que(out),
                num_splits: 2,
            }),
        )
        .add_link(out, sink(split, 0))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(P).unwrap();
    let info = sys.link_get_info(split).unwrap();
    assert_eq!(info.queues[0].channels.len(), 2);
    assert!(info.queues[0].channels.iter().all(|ch| ch.width == 32));

    let producer = sys.endpoint(src).unwrap();
    let consumer = sys.endpoint(out).unwrap();
    producer
        .put_full(producer.get_empty(0, Timeout::After(WAIT)).unwrap())
        .unwrap();
    let mut got: Vec<_> = (0..2)
        .map(|_| consumer.get_full(Timeout::After(WAIT)).unwrap())
        .collect();
    got.sort_by_key(|strip| strip.ch_num);
    for (s, strip) in got.iter().enumerate() {
        assert_eq!(strip.ch_num, s as u32);
        let frame = strip.video_frame().unwrap();
        assert_eq!(frame.info.width, 32);
        assert_eq!(frame.offsets[0], s * 64);
    }
    for strip in got {
        consumer.put_empty(strip).unwrap();
    }
    assert!(wait_until(WAIT, || chain.pending_buffers() == 0));
    chain.delete().unwrap();
}

/// A closed gate returns buffers at once; an open one passes them through
/// and counts them until they come back. Remote control reaches the gate
/// through the network command registry.
#[test]
fn gate_switches_and_reports_forward_count() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let gate = link(P, LinkType::Gate, 0);
    let out = link(P, LinkType::Endpoint, 1);

    let mut chain = ChainBuilder::new()
        .add_link(src, source(gate, vec![meta()], 4))
        .add_link(
            gate,
            LinkCreateParams::Gate(GateLinkParams {
                in_que: in_que(src, 0),
                out_que: out_que(out),
                prev_link_is_created: true,
                prev_link_info: None,
            }),
        )
        .add_link(out, sink(gate, 0))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(P).unwrap();
    let producer = sys.endpoint(src).unwrap();
    let consumer = sys.endpoint(out).unwrap();
    let push = |n: usize| {
        for _ in 0..n {
            let buffer = producer.get_empty(0, Timeout::After(WAIT)).unwrap();
            producer.put_full(buffer).unwrap();
        }
    };
    let forward_count = || -> GateForwardCount {
        let reply = sys
            .link_control(gate, LinkCmd::new(GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT))
            .unwrap();
        serde_json::from_slice(&reply).unwrap()
    };

    push(3);
    assert!(wait_until(WAIT, || {
        sys.link_statistics(gate).unwrap().total_drop() == 3
    }));
    assert!(matches!(
        consumer.get_full(Timeout::After(Duration::from_millis(50))),
        Err(Error::Timeout)
    ));

    // toggling without traffic in between changes nothing downstream
    for code in [
        GATE_LINK_CMD_SET_OPERATION_MODE_ON,
        GATE_LINK_CMD_SET_OPERATION_MODE_OFF,
        GATE_LINK_CMD_SET_OPERATION_MODE_ON,
        GATE_LINK_CMD_SET_OPERATION_MODE_ON,
    ] {
        sys.link_control(gate, LinkCmd::new(code)).unwrap();
    }
    push(2);
    let held: Vec<_> = (0..2)
        .map(|_| consumer.get_full(Timeout::After(WAIT)).unwrap())
        .collect();
    assert_eq!(
        forward_count(),
        GateForwardCount {
            status: GateStatus::On,
            buf_count: 2
        }
    );
    for buffer in held {
        consumer.put_empty(buffer).unwrap();
    }
    assert_eq!(forward_count().buf_count, 0);

    let ctrl = NetworkCtrl::new();
    ctrl.register_link_control(&sys).unwrap();
    let request = |cmd| {
        serde_json::to_vec(&LinkControlRequest {
            link_id: gate.encode(),
            cmd,
            params: serde_json::Value::Null,
        })
        .unwrap()
    };
    let ack = ctrl.dispatch(
        NETWORK_CTRL_CMD_LINK_CONTROL,
        &request(GATE_LINK_CMD_SET_OPERATION_MODE_OFF),
    );
    assert!(ack.is_ok());
    let ack = ctrl.dispatch(
        NETWORK_CTRL_CMD_LINK_CONTROL,
        &request(GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT),
    );
    let count: GateForwardCount = serde_json::from_slice(&ack.into_result().unwrap()).unwrap();
    assert_eq!(count.status, GateStatus::Off);
    let ack = ctrl.dispatch(NETWORK_CTRL_CMD_LINK_CONTROL, &request(0x1234));
    assert_eq!(ack.ret, status::EUNSUPPORTED_CMD);

    chain.delete().unwrap();
}

/// A source pool runs dry when everything is downstream, and a blocked
/// producer resumes as soon as a buffer is returned.
#[test]
fn source_pool_applies_backpressure() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let out = link(P, LinkType::Endpoint, 1);

    let mut chain = ChainBuilder::new()
        .add_link(src, source(out, vec![meta()], 2))
        .add_link(out, sink(src, 0))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    chain.start().unwrap();

    let sys = platform.context(P).unwrap();
    let producer = sys.endpoint(src).unwrap();
    for _ in 0..2 {
        producer
            .put_full(producer.get_empty(0, Timeout::NoWait).unwrap())
            .unwrap();
    }
    assert!(matches!(
        producer.get_empty(0, Timeout::NoWait),
        Err(Error::NotReady)
    ));
    assert!(matches!(
        producer.get_empty(0, Timeout::After(Duration::from_millis(20))),
        Err(Error::Timeout)
    ));
    assert!(wait_until(WAIT, || chain.pending_buffers() == 2));

    let consumer = sys.endpoint(out).unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let buffer = consumer.get_full(Timeout::After(WAIT)).unwrap();
        consumer.put_empty(buffer).unwrap();
    });
    let buffer = producer.get_empty(0, Timeout::After(WAIT)).unwrap();
    releaser.join().unwrap();
    assert!(matches!(
        sys.endpoint(out).unwrap().get_empty(0, Timeout::NoWait),
        Err(Error::InvalidState(_))
    ));
    producer.put_full(buffer).unwrap();

    chain.delete().unwrap();
}

/// Passes inputs through untouched and refuses to be deleted.
struct StubbornPlugin;

impl AlgorithmPlugin for StubbornPlugin {
    fn name(&self) -> &str {
        "stubborn"
    }

    fn create(&mut self, input: &QueInfo, _heap: &SharedHeap) -> links::Result<QueInfo> {
        Ok(input.clone())
    }

    fn process(&mut self, _input: &SystemBuffer, _output: Option<&mut SystemBuffer>) -> links::Result<()> {
        Ok(())
    }

    fn delete(&mut self) -> links::Result<()> {
        Err(Error::InvalidState("plugin still busy".into()))
    }
}

/// An algorithm whose plugin fails to delete still gives its output pools
/// back, and the failure is reported.
#[test]
fn failing_plugin_delete_still_frees_output_pools() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let alg = link(P, LinkType::Alg, 0);
    let out = link(P, LinkType::Endpoint, 1);

    let mut chain = ChainBuilder::new()
        .add_link(src, source(alg, vec![meta()], 2))
        .add_link(
            alg,
            LinkCreateParams::Alg(AlgorithmLinkParams {
                in_que: in_que(src, 0),
                out_que: Some(out_que(out)),
                num_out_buffers: 3,
                plugin: Box::new(StubbornPlugin),
            }),
        )
        .add_link(out, sink(alg, 0))
        .build()
        .unwrap();
    chain.create(&platform).unwrap();
    assert_eq!(platform.heap().block_count(), 5);

    assert!(matches!(chain.delete(), Err(Error::InvalidState(_))));
    assert_eq!(platform.heap().block_count(), 0);
}

/// Bad topologies are refused before anything is created.
#[test]
fn topology_errors_are_rejected() {
    let platform = setup_test(&[P]);
    let src = link(P, LinkType::Endpoint, 0);
    let out = link(P, LinkType::Endpoint, 1);
    let dup = link(P, LinkType::Dup, 0);

    assert!(matches!(ChainBuilder::new().build(), Err(Error::Graph(_))));
    assert!(matches!(
        ChainBuilder::new().add_link(dup, sink(src, 0)).build(),
        Err(Error::Graph(_))
    ));
    assert!(matches!(
        ChainBuilder::new()
            .add_link(out, sink(src, 0))
            .add_link(out, sink(src, 0))
            .build(),
        Err(Error::Graph(_))
    ));

    // reads from a link nobody created
    let mut dangling = ChainBuilder::new().add_link(out, sink(src, 0)).build().unwrap();
    assert!(matches!(dangling.create(&platform), Err(Error::Graph(_))));
    assert!(!platform.context(P).unwrap().contains(out));

    let mut chain = ChainBuilder::new()
        .add_link(src, source(out, vec![meta()], 2))
        .add_link(out, sink(src, 0))
        .build()
        .unwrap();
    assert!(matches!(chain.start(), Err(Error::InvalidState(_))));
    chain.create(&platform).unwrap();
    assert!(matches!(
        chain.create(&platform),
        Err(Error::InvalidState(_))
    ));
    chain.start().unwrap();
    chain.stop().unwrap();
    assert_eq!(chain.state(), ChainState::Stopped);
    chain.start().unwrap();
    chain.delete().unwrap();
    chain.delete().unwrap();
    assert!(platform.context(P).unwrap().link_ids().is_empty());
}
