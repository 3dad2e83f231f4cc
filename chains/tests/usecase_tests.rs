// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Runs the shipped use cases end to end.
//!
//! Every file under `usecases/` must load and build; the runnable ones are
//! run briefly and their reports checked for traffic on every link.

use std::{path::PathBuf, time::Duration};

use chains::{PluginRegistry, UseCase, run};
use links::{LinkId, LinkType};

fn usecase(name: &str) -> UseCase {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("usecases")
        .join(name);
    UseCase::from_json_file(&path)
        .unwrap_or_else(|err| panic!("Failed to load \"{}\": {err}", path.display()))
}

fn id(text: &str) -> LinkId {
    text.parse().unwrap()
}

/// Every shipped use case parses and forms a valid chain.
#[test]
fn shipped_use_cases_build() {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("usecases");
    let registry = PluginRegistry::default();
    let mut seen = 0;
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let usecase = UseCase::from_json_file(&path).unwrap();
        let chain = usecase.chain(&registry).unwrap();
        assert_eq!(chain.link_ids().len(), usecase.links.len());
        seen += 1;
    }
    assert!(seen >= 3);
}

/// Both consumers of a duplicated source see traffic.
#[test]
fn dup_use_case_feeds_both_consumers() {
    let usecase = usecase("null_src_dup_null.json");
    let report = run(&usecase, &PluginRegistry::default(), Duration::from_millis(200)).unwrap();

    let sink = id("IPU1_0/EP_0");
    assert!(report.delivered[&sink] > 0);
    let null = report.link(id("IPU1_0/NULL_0")).unwrap();
    assert!(null.total_recv() > 0);
    let dup = report.link(id("IPU1_0/DUP_0")).unwrap();
    assert!(dup.total_recv() >= null.total_recv());
}

/// Frames cross to the DSP, go through both plugins and are all returned.
#[test]
fn ipc_use_case_reaches_the_checksum() {
    let usecase = usecase("ipc_invert_checksum.json");
    assert_eq!(usecase.procs().len(), 2);
    let report = run(&usecase, &PluginRegistry::default(), Duration::from_millis(200)).unwrap();

    let ipc_out = report.link(id("IPU1_0/IPC_OUT_0")).unwrap();
    assert!(ipc_out.total_out() > 0);
    let checksum = report.link(id("DSP1/ALG_1")).unwrap();
    assert!(checksum.total_recv() > 0);
    assert!(report.delivered.is_empty());
    assert!(
        report
            .links
            .iter()
            .all(|link| link.id.kind() != LinkType::Endpoint)
    );
}

/// A use case whose plugin is not registered fails before anything runs.
#[test]
fn missing_plugin_fails_the_run() {
    let usecase = usecase("ipc_invert_checksum.json");
    let registry = PluginRegistry::empty();
    assert!(matches!(
        run(&usecase, &registry, Duration::from_millis(10)),
        Err(chains::Error::UnknownPlugin(_))
    ));
}
