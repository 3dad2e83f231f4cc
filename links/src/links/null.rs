// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Null link: a sink that releases every buffer as soon as it arrives,
//! optionally dumping the payloads to memory or a file first.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::check_count;
use crate::{
    Error, Result, SystemContext,
    link::{InQueParams, Link, LinkCmd, LinkInfo, LinkStatistics, prev_que_info},
    link_id::LinkId,
};

pub const NULL_LINK_CMD_GET_DUMP: u32 = 0x8000;

/// Maximum number of input queues of a Null link.
pub const NULL_LINK_MAX_IN_QUE: usize = 4;

/// What a Null link does with the payloads it receives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DumpMode {
    #[default]
    None,
    /// Copy payloads into memory until `max_bytes` are stored.
    Memory { max_bytes: usize },
    /// Append payloads to a file.
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullLinkParams {
    pub in_queues: Vec<InQueParams>,
    #[serde(default)]
    pub dump: DumpMode,
}

enum Dump {
    None,
    Memory { data: Vec<u8>, max_bytes: usize },
    File(BufWriter<File>),
}

struct NullState {
    dump: Dump,
    stats: LinkStatistics,
}

pub struct NullLink {
    id: LinkId,
    params: NullLinkParams,
    state: Mutex<NullState>,
}

impl NullLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: NullLinkParams) -> Result<Self> {
        check_count("input queues", params.in_queues.len(), NULL_LINK_MAX_IN_QUE)?;
        for in_que in &params.in_queues {
            prev_que_info(sys, in_que)?;
        }
        let dump = match &params.dump {
            DumpMode::None => Dump::None,
            DumpMode::Memory { max_bytes } => Dump::Memory {
                data: Vec::new(),
                max_bytes: *max_bytes,
            },
            DumpMode::File { path } => {
                tracing::info!("[{id}] Dumping payloads to {}", path.display());
                Dump::File(BufWriter::new(File::create(path)?))
            }
        };
        Ok(Self {
            id,
            params,
            state: Mutex::new(NullState {
                dump,
                stats: LinkStatistics::default(),
            }),
        })
    }
}

impl Link for NullLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        LinkInfo::default()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        for (que, in_que) in self.params.in_queues.iter().enumerate() {
            let mut list =
                sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
            if list.is_empty() {
                continue;
            }
            {
                let mut state = self.state.lock();
                let NullState { dump, stats } = &mut *state;
                for buffer in list.iter_mut() {
                    buffer.stamp_arrival();
                    let ch = stats.ch(que as u8, buffer.ch_num);
                    ch.recv += 1;
                    ch.process += 1;
                    match dump {
                        Dump::None => {}
                        Dump::Memory { data, max_bytes } => {
                            let mut bytes = Vec::new();
                            buffer.copy_payload(&mut bytes);
                            if data.len() + bytes.len() <= *max_bytes {
                                data.extend_from_slice(&bytes);
                                stats.bump("dumped_frames", 1);
                            } else {
                                stats.bump("dump_full", 1);
                            }
                        }
                        Dump::File(file) => {
                            let mut bytes = Vec::new();
                            buffer.copy_payload(&mut bytes);
                            match file.write_all(&bytes) {
                                Ok(()) => stats.bump("dumped_frames", 1),
                                Err(err) => {
                                    stats.bump("dump_errors", 1);
                                    tracing::warn!("[{}] Dump write failed: {err}", self.id);
                                }
                            }
                        }
                    }
                }
            }
            sys.put_links_empty_buffers(in_que.prev_link_id, in_que.prev_link_que_id, list)?;
        }
        Ok(())
    }

    fn control(&self, _sys: &SystemContext, cmd: &LinkCmd) -> Result<Vec<u8>> {
        match cmd.code {
            NULL_LINK_CMD_GET_DUMP => match &self.state.lock().dump {
                Dump::Memory { data, .. } => Ok(data.clone()),
                _ => Err(Error::InvalidState(format!(
                    "{} does not dump to memory.",
                    self.id
                ))),
            },
            code => Err(Error::UnsupportedCmd(code)),
        }
    }

    fn delete(&self, _sys: &SystemContext) -> Result<()> {
        if let Dump::File(file) = &mut self.state.lock().dump {
            file.flush()?;
        }
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        self.state.lock().stats.clone()
    }
}
