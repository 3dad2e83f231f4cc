// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! JSON use-case files.
//!
//! A use case names its links by id; the link type in the id selects how the
//! `params` object is read. Algorithm links name their plugin instead of
//! carrying one:
//!
//! ```json
//! {
//!   "name": "capture_invert_null",
//!   "links": [
//!     { "id": "IPU1_0/NULL_SRC_0", "params": { "out_que": { "next_link": "IPU1_0/ALG_0" }, "channels": [...] } },
//!     { "id": "IPU1_0/ALG_0", "params": { "in_que": { "prev_link_id": "IPU1_0/NULL_SRC_0" },
//!                                       "out_que": { "next_link": "IPU1_0/NULL_0" },
//!                                       "num_out_buffers": 4, "plugin": "invert" } },
//!     { "id": "IPU1_0/NULL_0", "params": { "in_queues": [{ "prev_link_id": "IPU1_0/ALG_0" }] } }
//!   ]
//! }
//! ```

use std::{collections::BTreeSet, path::Path};

use links::{
    Chain, ChainBuilder, LinkId, LinkType, ProcId,
    config::SystemConfig,
    link::{InQueParams, OutQueParams},
    links::{LinkCreateParams, algorithm::AlgorithmLinkParams},
};
use serde::{Deserialize, Serialize};

use crate::{Error, PluginRegistry, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Platform configuration; defaults apply when absent.
    #[serde(default)]
    pub config: SystemConfig,
    pub links: Vec<LinkEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub id: LinkId,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Use-case form of [`AlgorithmLinkParams`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub in_que: InQueParams,
    #[serde(default)]
    pub out_que: Option<OutQueParams>,
    #[serde(default)]
    pub num_out_buffers: usize,
    pub plugin: String,
    /// Passed to the plugin factory.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl UseCase {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let usecase: UseCase = serde_json::from_str(json)?;
        if usecase.links.is_empty() {
            return Err(Error::InvalidUseCase(format!(
                "{} declares no links.",
                usecase.name
            )));
        }
        usecase.config.validate()?;
        Ok(usecase)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let usecase = Self::from_json_str(&text)?;
        tracing::debug!(
            "Loaded use case {} from {}",
            usecase.name,
            path.as_ref().display()
        );
        Ok(usecase)
    }

    /// Processors the use case runs links on, in numeric order.
    pub fn procs(&self) -> Vec<ProcId> {
        let procs: BTreeSet<ProcId> = self.links.iter().map(|link| link.id.proc()).collect();
        procs.into_iter().collect()
    }

    /// Builds the chain, instantiating algorithm plugins from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for parameters that do not fit the link type,
    /// [`Error::UnknownPlugin`] for an unregistered plugin and
    /// [`Error::Links`] if the topology is invalid.
    pub fn chain(&self, registry: &PluginRegistry) -> Result<Chain> {
        let mut builder = ChainBuilder::new();
        for link in &self.links {
            let params = create_params(link, registry).map_err(|err| match err {
                Error::Json(err) => Error::InvalidUseCase(format!("{}: {err}", link.id)),
                other => other,
            })?;
            builder = builder.add_link(link.id, params);
        }
        Ok(builder.build()?)
    }
}

fn create_params(link: &LinkEntry, registry: &PluginRegistry) -> Result<LinkCreateParams> {
    let params = link.params.clone();
    Ok(match link.id.kind() {
        LinkType::Dup => LinkCreateParams::Dup(serde_json::from_value(params)?),
        LinkType::Merge => LinkCreateParams::Merge(serde_json::from_value(params)?),
        LinkType::Select => LinkCreateParams::Select(serde_json::from_value(params)?),
        LinkType::Split => LinkCreateParams::Split(serde_json::from_value(params)?),
        LinkType::Sync => LinkCreateParams::Sync(serde_json::from_value(params)?),
        LinkType::Gate => LinkCreateParams::Gate(serde_json::from_value(params)?),
        LinkType::Null => LinkCreateParams::Null(serde_json::from_value(params)?),
        LinkType::NullSrc => LinkCreateParams::NullSrc(serde_json::from_value(params)?),
        LinkType::Save => LinkCreateParams::Save(serde_json::from_value(params)?),
        LinkType::IpcOut => LinkCreateParams::IpcOut(serde_json::from_value(params)?),
        LinkType::IpcIn => LinkCreateParams::IpcIn(serde_json::from_value(params)?),
        LinkType::Endpoint => LinkCreateParams::Endpoint(serde_json::from_value(params)?),
        LinkType::Alg => {
            let spec: AlgorithmSpec = serde_json::from_value(params)?;
            LinkCreateParams::Alg(AlgorithmLinkParams {
                in_que: spec.in_que,
                out_que: spec.out_que,
                num_out_buffers: spec.num_out_buffers,
                plugin: registry.create(&spec.plugin, &spec.options)?,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATED: &str = r#"{
        "name": "gated",
        "config": { "drain_timeout_ms": 100 },
        "links": [
            { "id": "IPU1_0/NULL_SRC_0", "params": {
                "out_que": { "next_link": "IPU1_0/GATE_0" },
                "channels": [{ "buf_type": "meta_data", "format": "raw", "width": 16, "height": 1, "pitch": [16, 0] }]
            } },
            { "id": "IPU1_0/GATE_0", "params": {
                "in_que": { "prev_link_id": "IPU1_0/NULL_SRC_0" },
                "out_que": { "next_link": "IPU1_0/IPC_OUT_0" }
            } },
            { "id": "IPU1_0/IPC_OUT_0", "params": {
                "in_que": { "prev_link_id": "IPU1_0/GATE_0" },
                "out_que": { "next_link": "DSP1/IPC_IN_0" }
            } },
            { "id": "DSP1/IPC_IN_0", "params": {
                "in_que": { "prev_link_id": "IPU1_0/IPC_OUT_0" },
                "out_que": { "next_link": "DSP1/NULL_0" }
            } },
            { "id": "DSP1/NULL_0", "params": { "in_queues": [{ "prev_link_id": "DSP1/IPC_IN_0" }] } }
        ]
    }"#;

    #[test]
    fn parses_links_by_type() {
        let usecase = UseCase::from_json_str(GATED).unwrap();
        assert_eq!(usecase.config.drain_timeout_ms, 100);
        assert_eq!(usecase.procs(), vec![ProcId::Ipu1_0, ProcId::Dsp1]);
        let chain = usecase.chain(&PluginRegistry::default()).unwrap();
        assert_eq!(chain.link_ids().len(), 5);
        assert_eq!(chain.link_ids()[0].kind(), LinkType::NullSrc);
        assert_eq!(chain.link_ids()[4].kind(), LinkType::Null);
    }

    #[test]
    fn processors_are_only_joined_through_ipc() {
        let json = r#"{ "name": "direct", "links": [
            { "id": "IPU1_0/NULL_SRC_0", "params": {
                "out_que": { "next_link": "DSP1/NULL_0" },
                "channels": [{ "buf_type": "meta_data", "format": "raw", "width": 16, "height": 1, "pitch": [16, 0] }]
            } },
            { "id": "DSP1/NULL_0", "params": { "in_queues": [{ "prev_link_id": "IPU1_0/NULL_SRC_0" }] } }
        ] }"#;
        let usecase = UseCase::from_json_str(json).unwrap();
        assert!(matches!(
            usecase.chain(&PluginRegistry::default()),
            Err(Error::Links(links::Error::Graph(_)))
        ));
    }

    #[test]
    fn mismatched_params_name_the_link() {
        let json = r#"{ "name": "bad", "links": [ { "id": "IPU1_0/DUP_0", "params": { "in_queues": [] } } ] }"#;
        let usecase = UseCase::from_json_str(json).unwrap();
        match usecase.chain(&PluginRegistry::default()) {
            Err(Error::InvalidUseCase(msg)) => assert!(msg.starts_with("IPU1_0/DUP_0")),
            other => panic!("unexpected {:?}", other.map(|c| c.link_ids().to_vec())),
        }
    }

    #[test]
    fn unknown_plugins_are_reported() {
        let json = r#"{ "name": "alg", "links": [ { "id": "IPU1_0/ALG_0", "params": {
            "in_que": { "prev_link_id": "IPU1_0/NULL_SRC_0" }, "plugin": "sharpen" } } ] }"#;
        let usecase = UseCase::from_json_str(json).unwrap();
        assert!(matches!(
            usecase.chain(&PluginRegistry::default()),
            Err(Error::UnknownPlugin(name)) if name == "sharpen"
        ));
    }

    #[test]
    fn empty_use_cases_are_rejected() {
        assert!(matches!(
            UseCase::from_json_str(r#"{ "name": "none", "links": [] }"#),
            Err(Error::InvalidUseCase(_))
        ));
    }
}
