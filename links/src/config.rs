// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration shared by every [`crate::SystemContext`] of a platform.
//!
//! All fields have defaults, so an empty JSON object is a valid configuration:
//!
//! ```
//! use links::config::SystemConfig;
//!
//! # fn main() -> Result<(), links::Error> {
//! let config = SystemConfig::from_json_str(r#"{ "ack_timeout_ms": 250 }"#)?;
//! assert_eq!(config.ack_timeout().as_millis(), 250);
//! assert_eq!(config.mailbox_depth, SystemConfig::default().mailbox_depth);
//! # Ok(())
//! # }
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, notify::TransportPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Depth of each link task's command mailbox.
    pub mailbox_depth: usize,
    /// How long a caller waits for a link to acknowledge an administrative command.
    pub ack_timeout_ms: u64,
    /// How long a chain waits for in-flight buffers to come home before deleting links.
    pub drain_timeout_ms: u64,
    /// Element count of the rings created by IPC-Out links.
    pub ipc_que_elements: u32,
    /// Depth of each processor's notify queue on the bus.
    pub notify_que_depth: usize,
    /// What to do when a notify cannot be delivered.
    pub transport_policy: TransportPolicy,
    /// Capacity of the heap shared by all processors of a platform.
    pub shared_heap_bytes: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mailbox_depth: 32,
            ack_timeout_ms: 1000,
            drain_timeout_ms: 2000,
            ipc_que_elements: 64,
            notify_que_depth: 256,
            transport_policy: TransportPolicy::default(),
            shared_heap_bytes: 64 << 20,
        }
    }
}

impl SystemConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Parses a configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed JSON and [`Error::InvalidParams`] if
    /// a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SystemConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mailbox_depth == 0 {
            return Err(Error::InvalidParams("mailbox_depth must be non-zero.".into()));
        }
        if self.notify_que_depth == 0 {
            return Err(Error::InvalidParams("notify_que_depth must be non-zero.".into()));
        }
        if self.shared_heap_bytes == 0 {
            return Err(Error::InvalidParams(
                "shared_heap_bytes must be non-zero.".into(),
            ));
        }
        if self.ipc_que_elements < 2 {
            return Err(Error::InvalidParams(
                "ipc_que_elements must be at least 2.".into(),
            ));
        }
        Ok(())
    }
}
