// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Link addressing.
//!
//! Every link in the system is addressed by a [`LinkId`]: the processor it runs
//! on, its link type and an instance number. On the wire (notify payloads, IPC
//! ring elements, control replies) a link id travels as a packed `u32`:
//!
//! ```text
//!  31       15   12 11    8 7          0
//! ┌─────────┬───────┬───────┬────────────┐
//! │ unused  │ ntype │ proc  │  local id  │
//! └─────────┴───────┴───────┴────────────┘
//! ```
//!
//! The local id is `link type base + instance`, so each processor has a flat
//! namespace of at most [`LINK_ID_MAX`] links. The notify type nibble is only
//! used by [`NotifyPayload`] and is always zero in a plain link id.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Size of the per-processor local link id namespace.
pub const LINK_ID_MAX: u32 = 128;

/// Raw value used for "no link".
pub const LINK_ID_INVALID: u32 = 0xFFFF_FFFF;

const PROC_SHIFT: u32 = 8;
const PROC_MASK: u32 = 0xF;
const LOCAL_MASK: u32 = 0xFF;
const NOTIFY_TYPE_SHIFT: u32 = 12;
const NOTIFY_TYPE_MASK: u32 = 0xF;

/// Processor cores of the SoC, numbered as in the link id encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcId {
    Ipu1_0 = 0,
    Ipu1_1 = 1,
    A15_0 = 2,
    Dsp1 = 3,
    Dsp2 = 4,
    Eve1 = 5,
    Eve2 = 6,
    Eve3 = 7,
    Eve4 = 8,
}

impl ProcId {
    /// All processors, in numeric order.
    pub const ALL: [ProcId; 9] = [
        ProcId::Ipu1_0,
        ProcId::Ipu1_1,
        ProcId::A15_0,
        ProcId::Dsp1,
        ProcId::Dsp2,
        ProcId::Eve1,
        ProcId::Eve2,
        ProcId::Eve3,
        ProcId::Eve4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProcId::Ipu1_0 => "IPU1_0",
            ProcId::Ipu1_1 => "IPU1_1",
            ProcId::A15_0 => "A15_0",
            ProcId::Dsp1 => "DSP1",
            ProcId::Dsp2 => "DSP2",
            ProcId::Eve1 => "EVE1",
            ProcId::Eve2 => "EVE2",
            ProcId::Eve3 => "EVE3",
            ProcId::Eve4 => "EVE4",
        }
    }
}

impl TryFrom<u32> for ProcId {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        ProcId::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| Error::InvalidParams(format!("Invalid processor id {value}.")))
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProcId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProcId::ALL
            .into_iter()
            .find(|proc| proc.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidParams(format!("Unknown processor \"{s}\".")))
    }
}

/// Link types and their slice of the local id namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkType {
    IpcOut,
    IpcIn,
    Null,
    NullSrc,
    Dup,
    Gate,
    Sync,
    Merge,
    Select,
    Split,
    Save,
    Alg,
    Endpoint,
}

impl LinkType {
    pub const ALL: [LinkType; 13] = [
        LinkType::IpcOut,
        LinkType::IpcIn,
        LinkType::Null,
        LinkType::NullSrc,
        LinkType::Dup,
        LinkType::Gate,
        LinkType::Sync,
        LinkType::Merge,
        LinkType::Select,
        LinkType::Split,
        LinkType::Save,
        LinkType::Alg,
        LinkType::Endpoint,
    ];

    /// First local id assigned to this link type.
    pub const fn base(self) -> u8 {
        match self {
            LinkType::IpcOut => 0,
            LinkType::IpcIn => 4,
            LinkType::Null => 8,
            LinkType::NullSrc => 12,
            LinkType::Dup => 14,
            LinkType::Gate => 18,
            LinkType::Sync => 22,
            LinkType::Merge => 26,
            LinkType::Select => 30,
            LinkType::Split => 34,
            LinkType::Save => 36,
            LinkType::Alg => 38,
            LinkType::Endpoint => 54,
        }
    }

    /// Number of instances of this link type a processor can host.
    pub const fn max_instances(self) -> u8 {
        match self {
            LinkType::IpcOut | LinkType::IpcIn => 4,
            LinkType::Null => 4,
            LinkType::NullSrc => 2,
            LinkType::Dup | LinkType::Gate | LinkType::Sync => 4,
            LinkType::Merge | LinkType::Select => 4,
            LinkType::Split | LinkType::Save => 2,
            LinkType::Alg => 16,
            LinkType::Endpoint => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LinkType::IpcOut => "IPC_OUT",
            LinkType::IpcIn => "IPC_IN",
            LinkType::Null => "NULL",
            LinkType::NullSrc => "NULL_SRC",
            LinkType::Dup => "DUP",
            LinkType::Gate => "GATE",
            LinkType::Sync => "SYNC",
            LinkType::Merge => "MERGE",
            LinkType::Select => "SELECT",
            LinkType::Split => "SPLIT",
            LinkType::Save => "SAVE",
            LinkType::Alg => "ALG",
            LinkType::Endpoint => "EP",
        }
    }

    fn from_local_id(local: u8) -> Option<(LinkType, u8)> {
        LinkType::ALL.into_iter().find_map(|kind| {
            let base = kind.base();
            (local >= base && local < base + kind.max_instances()).then(|| (kind, local - base))
        })
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address of one link: processor, link type and instance.
///
/// Constructed through [`LinkId::new`] or [`LinkId::decode`], both of which
/// validate every field, so a `LinkId` value is always encodable.
///
/// The textual form is `PROC/TYPE_INSTANCE`, e.g. `DSP1/DUP_0`; it is also the
/// serde representation used in chain topology files.
///
/// # Examples
///
/// ```
/// use links::{LinkId, LinkType, ProcId};
///
/// # fn main() -> Result<(), links::Error> {
/// let id = LinkId::new(ProcId::Dsp1, LinkType::Dup, 1)?;
/// assert_eq!(id.encode(), (3 << 8) | 15);
/// assert_eq!(LinkId::decode(id.encode())?, id);
/// assert_eq!(id.to_string(), "DSP1/DUP_1");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkId {
    proc: ProcId,
    kind: LinkType,
    instance: u8,
}

impl LinkId {
    /// Creates a link id, rejecting instances beyond the link type's range.
    pub fn new(proc: ProcId, kind: LinkType, instance: u8) -> Result<Self> {
        if instance >= kind.max_instances() {
            return Err(Error::InvalidParams(format!(
                "{kind} instance {instance} exceeds the maximum of {}.",
                kind.max_instances()
            )));
        }
        Ok(Self {
            proc,
            kind,
            instance,
        })
    }

    pub fn proc(&self) -> ProcId {
        self.proc
    }

    pub fn kind(&self) -> LinkType {
        self.kind
    }

    pub fn instance(&self) -> u8 {
        self.instance
    }

    /// Index of this link in its processor's local namespace.
    pub fn local_id(&self) -> u8 {
        self.kind.base() + self.instance
    }

    /// Packs the id into its 32-bit wire form.
    pub fn encode(&self) -> u32 {
        ((self.proc as u32 & PROC_MASK) << PROC_SHIFT) | (self.local_id() as u32 & LOCAL_MASK)
    }

    /// Unpacks a 32-bit wire value. Bits outside the processor and local id
    /// fields must be clear.
    pub fn decode(raw: u32) -> Result<Self> {
        if raw & !((PROC_MASK << PROC_SHIFT) | LOCAL_MASK) != 0 {
            return Err(Error::InvalidLinkId(raw));
        }
        let proc = ProcId::try_from((raw >> PROC_SHIFT) & PROC_MASK)
            .map_err(|_| Error::InvalidLinkId(raw))?;
        let local = (raw & LOCAL_MASK) as u8;
        let (kind, instance) = LinkType::from_local_id(local).ok_or(Error::InvalidLinkId(raw))?;
        Ok(Self {
            proc,
            kind,
            instance,
        })
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}_{}", self.proc, self.kind, self.instance)
    }
}

impl FromStr for LinkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidParams(format!("Malformed link id \"{s}\"."));
        let (proc, link) = s.split_once('/').ok_or_else(invalid)?;
        let (kind, instance) = link.rsplit_once('_').ok_or_else(invalid)?;
        let kind = LinkType::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(kind))
            .ok_or_else(invalid)?;
        let instance = instance.parse::<u8>().map_err(|_| invalid())?;
        LinkId::new(proc.parse()?, kind, instance)
    }
}

impl TryFrom<String> for LinkId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LinkId> for String {
    fn from(value: LinkId) -> Self {
        value.to_string()
    }
}

/// The 4-byte value carried by a cross-core notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPayload {
    /// Wake the given link with `NEW_DATA`.
    Link(LinkId),
    /// A control message from `src` is waiting in the receiver's message queue.
    Msg { src: ProcId },
    /// `src` has answered a control message sent from the receiver.
    MsgAck { src: ProcId },
}

const NOTIFY_TYPE_LINK_ID: u32 = 0;
const NOTIFY_TYPE_MSG: u32 = 1;
const NOTIFY_TYPE_MSG_ACK: u32 = 2;

impl NotifyPayload {
    pub fn encode(&self) -> u32 {
        match self {
            NotifyPayload::Link(link_id) => {
                link_id.encode() | (NOTIFY_TYPE_LINK_ID << NOTIFY_TYPE_SHIFT)
            }
            NotifyPayload::Msg { src } => {
                ((*src as u32 & PROC_MASK) << PROC_SHIFT) | (NOTIFY_TYPE_MSG << NOTIFY_TYPE_SHIFT)
            }
            NotifyPayload::MsgAck { src } => {
                ((*src as u32 & PROC_MASK) << PROC_SHIFT)
                    | (NOTIFY_TYPE_MSG_ACK << NOTIFY_TYPE_SHIFT)
            }
        }
    }

    pub fn decode(raw: u32) -> Result<Self> {
        match (raw >> NOTIFY_TYPE_SHIFT) & NOTIFY_TYPE_MASK {
            NOTIFY_TYPE_LINK_ID => Ok(NotifyPayload::Link(LinkId::decode(
                raw & !(NOTIFY_TYPE_MASK << NOTIFY_TYPE_SHIFT),
            )?)),
            NOTIFY_TYPE_MSG => Ok(NotifyPayload::Msg {
                src: ProcId::try_from((raw >> PROC_SHIFT) & PROC_MASK)?,
            }),
            NOTIFY_TYPE_MSG_ACK => Ok(NotifyPayload::MsgAck {
                src: ProcId::try_from((raw >> PROC_SHIFT) & PROC_MASK)?,
            }),
            other => Err(Error::InvalidParams(format!(
                "Unknown notify type {other} in payload {raw:#010x}."
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_local_id_decodes_back() {
        for kind in LinkType::ALL {
            for instance in 0..kind.max_instances() {
                let id = LinkId::new(ProcId::Eve4, kind, instance).unwrap();
                assert!(u32::from(id.local_id()) < LINK_ID_MAX);
                assert_eq!(LinkId::decode(id.encode()).unwrap(), id);
            }
        }
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        assert!(LinkId::new(ProcId::A15_0, LinkType::Split, 2).is_err());
        assert!(LinkId::decode(LINK_ID_INVALID).is_err());
        // processor 9 does not exist
        assert!(LinkId::decode(9 << 8).is_err());
        // local id 127 is not assigned to any link type
        assert!(LinkId::decode(127).is_err());
    }

    #[test]
    fn text_form_parses() {
        let id: LinkId = "ipu1_0/null_src_1".parse().unwrap();
        assert_eq!(id, LinkId::new(ProcId::Ipu1_0, LinkType::NullSrc, 1).unwrap());
        assert!("DSP1-DUP_0".parse::<LinkId>().is_err());
    }

    #[test]
    fn notify_payload_keeps_type_nibble() {
        let id = LinkId::new(ProcId::Dsp2, LinkType::IpcIn, 3).unwrap();
        let link = NotifyPayload::Link(id);
        assert_eq!(NotifyPayload::decode(link.encode()).unwrap(), link);

        let msg = NotifyPayload::Msg { src: ProcId::Eve2 };
        assert_eq!(msg.encode() >> 12, 1);
        assert_eq!(NotifyPayload::decode(msg.encode()).unwrap(), msg);
    }
}
