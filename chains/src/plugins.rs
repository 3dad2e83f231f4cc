// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Algorithm plugins that use cases can name by string.
//!
//! | Name       | Output | Effect                                              |
//! |------------|--------|-----------------------------------------------------|
//! | `copy`     | yes    | copies every input payload into the output buffer   |
//! | `invert`   | yes    | like `copy`, with every byte inverted               |
//! | `checksum` | no     | sink folding every payload into a running checksum  |

use std::collections::BTreeMap;

use links::{
    buffer::{BufferType, MAX_PLANES, Payload, SystemBuffer},
    link::{LinkCmd, QueInfo},
    links::algorithm::AlgorithmPlugin,
    shared_mem::{SharedBlock, SharedHeap},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Returns the checksum plugin's [`ChecksumReport`] as JSON.
pub const CHECKSUM_CMD_GET_REPORT: u32 = 0x1000;
/// Clears the checksum plugin's counters.
pub const CHECKSUM_CMD_RESET: u32 = 0x1001;

pub type PluginFactory = fn(&serde_json::Value) -> Result<Box<dyn AlgorithmPlugin>>;

/// Maps plugin names to factories.
///
/// # Examples
///
/// ```
/// use chains::PluginRegistry;
///
/// let registry = PluginRegistry::default();
/// assert!(registry.names().any(|name| name == "invert"));
/// assert!(registry.create("missing", &serde_json::Value::Null).is_err());
/// ```
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("copy", |_| Ok(Box::new(ByteMap::new("copy", |b| b))));
        registry.register("invert", |_| Ok(Box::new(ByteMap::new("invert", |b| !b))));
        registry.register("checksum", |_| Ok(Box::new(Checksum::default())));
        registry
    }
}

impl PluginRegistry {
    /// A registry without the built-in plugins.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Adds or replaces the factory for `name`.
    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            tracing::debug!("Plugin {name} replaced");
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiates plugin `name` with its use-case `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPlugin`] if nothing is registered under `name`.
    pub fn create(&self, name: &str, options: &serde_json::Value) -> Result<Box<dyn AlgorithmPlugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        factory(options)
    }
}

fn payload_blocks(payload: &Payload) -> Vec<(SharedBlock, usize, usize)> {
    match payload {
        Payload::VideoFrame(frame) => (0..MAX_PLANES)
            .filter_map(|plane| {
                let block = frame.planes[plane].clone()?;
                let len = block.len().saturating_sub(frame.offsets[plane]);
                Some((block, frame.offsets[plane], len))
            })
            .collect(),
        Payload::Bitstream(bits) => bits
            .block
            .clone()
            .map(|block| (block, 0, bits.fill_length))
            .into_iter()
            .collect(),
        Payload::MetaData(meta) => meta
            .block
            .clone()
            .map(|block| (block, 0, meta.fill_length))
            .into_iter()
            .collect(),
        Payload::Composite(_) => Vec::new(),
    }
}

/// Copies the payload of `input` into `output` through `f`, byte by byte.
fn map_payload(input: &SystemBuffer, output: &mut SystemBuffer, f: fn(u8) -> u8) -> links::Result<()> {
    if input.buf_type() != output.buf_type() {
        return Err(links::Error::InvalidParams(format!(
            "Cannot map a {:?} payload into a {:?} buffer.",
            input.buf_type(),
            output.buf_type()
        )));
    }
    let src = payload_blocks(&input.payload);
    let dst = payload_blocks(&output.payload);
    let mut copied = 0;
    for ((src, src_off, len), (dst, dst_off, _)) in src.iter().zip(&dst) {
        let from = src.read();
        let mut to = dst.write();
        let len = (*len)
            .min(from.len().saturating_sub(*src_off))
            .min(to.len().saturating_sub(*dst_off));
        for (out, byte) in to[*dst_off..*dst_off + len]
            .iter_mut()
            .zip(&from[*src_off..*src_off + len])
        {
            *out = f(*byte);
        }
        copied = len;
    }
    match &mut output.payload {
        Payload::Bitstream(bits) => bits.fill_length = copied,
        Payload::MetaData(meta) => meta.fill_length = copied,
        Payload::VideoFrame(frame) => {
            if let Some(input) = input.video_frame() {
                frame.info = input.info;
            }
        }
        Payload::Composite(_) => {}
    }
    Ok(())
}

/// Output mirrors the input layout; each byte goes through a fixed map.
struct ByteMap {
    name: &'static str,
    map: fn(u8) -> u8,
}

impl ByteMap {
    fn new(name: &'static str, map: fn(u8) -> u8) -> Self {
        Self { name, map }
    }
}

impl AlgorithmPlugin for ByteMap {
    fn name(&self) -> &str {
        self.name
    }

    fn create(&mut self, input: &QueInfo, _heap: &SharedHeap) -> links::Result<QueInfo> {
        if let Some(ch) = input
            .channels
            .iter()
            .position(|ch| ch.buf_type == BufferType::VideoFrameContainer)
        {
            return Err(links::Error::InvalidParams(format!(
                "{}: channel {ch} carries composite buffers.",
                self.name
            )));
        }
        Ok(input.clone())
    }

    fn process(&mut self, input: &SystemBuffer, output: Option<&mut SystemBuffer>) -> links::Result<()> {
        match output {
            Some(output) => map_payload(input, output, self.map),
            None => Ok(()),
        }
    }
}

/// Reply of [`CHECKSUM_CMD_GET_REPORT`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumReport {
    pub frames: u64,
    pub bytes: u64,
    /// FNV-1a over every payload byte seen, in arrival order.
    pub checksum: u64,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

struct Checksum {
    report: ChecksumReport,
}

impl Default for Checksum {
    fn default() -> Self {
        Self {
            report: ChecksumReport {
                checksum: FNV_OFFSET,
                ..Default::default()
            },
        }
    }
}

impl AlgorithmPlugin for Checksum {
    fn name(&self) -> &str {
        "checksum"
    }

    fn create(&mut self, input: &QueInfo, _heap: &SharedHeap) -> links::Result<QueInfo> {
        Ok(input.clone())
    }

    fn process(&mut self, input: &SystemBuffer, _output: Option<&mut SystemBuffer>) -> links::Result<()> {
        let mut data = Vec::new();
        input.copy_payload(&mut data);
        let report = &mut self.report;
        for byte in &data {
            report.checksum = (report.checksum ^ u64::from(*byte)).wrapping_mul(FNV_PRIME);
        }
        report.frames += 1;
        report.bytes += data.len() as u64;
        Ok(())
    }

    fn control(&mut self, cmd: &LinkCmd) -> links::Result<Vec<u8>> {
        match cmd.code {
            CHECKSUM_CMD_GET_REPORT => Ok(serde_json::to_vec(&self.report)?),
            CHECKSUM_CMD_RESET => {
                *self = Self::default();
                Ok(Vec::new())
            }
            code => Err(links::Error::UnsupportedCmd(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use links::{
        buffer::{BufferId, MetaData},
        link::ChInfo,
        LinkId, LinkType, ProcId,
    };

    use super::*;

    fn meta_buffer(heap: &SharedHeap, bytes: &[u8], index: u16) -> SystemBuffer {
        let block = heap.alloc(16).unwrap();
        block.write()[..bytes.len()].copy_from_slice(bytes);
        let owner = LinkId::new(ProcId::Ipu1_0, LinkType::Alg, 0).unwrap();
        SystemBuffer::new(
            BufferId {
                owner,
                que_id: 0,
                index,
            },
            Payload::MetaData(MetaData {
                block: Some(block),
                fill_length: bytes.len(),
            }),
        )
    }

    #[test]
    fn invert_maps_every_filled_byte() {
        let heap = SharedHeap::new(1 << 12);
        let registry = PluginRegistry::default();
        let mut plugin = registry.create("invert", &serde_json::Value::Null).unwrap();
        let input = QueInfo {
            channels: vec![ChInfo::opaque(BufferType::MetaData, 16)],
        };
        assert_eq!(plugin.create(&input, &heap).unwrap(), input);

        let src = meta_buffer(&heap, &[0x00, 0x0f, 0xff], 0);
        let mut dst = meta_buffer(&heap, &[], 1);
        plugin.process(&src, Some(&mut dst)).unwrap();
        let mut out = Vec::new();
        dst.copy_payload(&mut out);
        assert_eq!(out, vec![0xff, 0xf0, 0x00]);
    }

    #[test]
    fn checksum_reports_and_resets() {
        let heap = SharedHeap::new(1 << 12);
        let mut plugin = PluginRegistry::default()
            .create("checksum", &serde_json::Value::Null)
            .unwrap();
        plugin.process(&meta_buffer(&heap, b"abc", 0), None).unwrap();
        let reply = plugin.control(&LinkCmd::new(CHECKSUM_CMD_GET_REPORT)).unwrap();
        let report: ChecksumReport = serde_json::from_slice(&reply).unwrap();
        assert_eq!((report.frames, report.bytes), (1, 3));
        assert_ne!(report.checksum, FNV_OFFSET);

        plugin.control(&LinkCmd::new(CHECKSUM_CMD_RESET)).unwrap();
        let reply = plugin.control(&LinkCmd::new(CHECKSUM_CMD_GET_REPORT)).unwrap();
        let report: ChecksumReport = serde_json::from_slice(&reply).unwrap();
        assert_eq!(report, Checksum::default().report);
    }
}
