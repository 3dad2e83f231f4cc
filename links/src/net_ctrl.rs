// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Named command dispatch for remote control clients.
//!
//! A client sends a command name and an opaque parameter blob and gets back
//! a [`NetworkCtrlAck`] carrying a status code and an optional reply. How the
//! request reaches the process is up to the embedder.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result, SystemContext,
    error::status,
    link::LinkCmd,
    link_id::LinkId,
};

/// Longest accepted command name, in bytes.
pub const NETWORK_CTRL_MAX_CMD_NAME: usize = 64;

/// Name of the built-in command that forwards to [`SystemContext::link_control`].
pub const NETWORK_CTRL_CMD_LINK_CONTROL: &str = "link_control";

pub type NetworkCtrlHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Answer to one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCtrlAck {
    /// Status code, see [`crate::error::status`].
    pub ret: i32,
    pub reply: Vec<u8>,
}

impl NetworkCtrlAck {
    pub fn is_ok(&self) -> bool {
        self.ret == status::SOK
    }

    /// Turns the ack back into the result the handler returned.
    pub fn into_result(self) -> Result<Vec<u8>> {
        Error::from_status(self.ret)?;
        Ok(self.reply)
    }
}

/// Parameters of the built-in `link_control` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkControlRequest {
    /// Encoded [`LinkId`].
    pub link_id: u32,
    pub cmd: u32,
    /// Command parameters, forwarded as JSON.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Registry of named command handlers.
///
/// # Examples
///
/// ```
/// use links::net_ctrl::NetworkCtrl;
///
/// # fn main() -> Result<(), links::Error> {
/// let ctrl = NetworkCtrl::new();
/// ctrl.register("echo", |params| Ok(params.to_vec()))?;
/// let ack = ctrl.dispatch("echo", b"ping");
/// assert!(ack.is_ok());
/// assert_eq!(ack.reply, b"ping");
/// assert!(!ctrl.dispatch("missing", &[]).is_ok());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct NetworkCtrl {
    handlers: RwLock<HashMap<String, Arc<NetworkCtrlHandler>>>,
}

impl NetworkCtrl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] for an empty or over-long name and
    /// [`Error::InvalidState`] if the name is taken.
    pub fn register<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        if name.is_empty() || name.len() > NETWORK_CTRL_MAX_CMD_NAME {
            return Err(Error::InvalidParams(format!(
                "Command name must be 1..={NETWORK_CTRL_MAX_CMD_NAME} bytes, got {}.",
                name.len()
            )));
        }
        let mut handlers = self.handlers.write();
        if handlers.contains_key(name) {
            return Err(Error::InvalidState(format!(
                "Command {name} is already registered."
            )));
        }
        handlers.insert(name.to_string(), Arc::new(Box::new(handler)));
        tracing::debug!("Network command {name} registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registers `link_control`, which forwards a JSON
    /// [`LinkControlRequest`] to `sys`.
    pub fn register_link_control(&self, sys: &Arc<SystemContext>) -> Result<()> {
        let sys: Weak<SystemContext> = Arc::downgrade(sys);
        self.register(NETWORK_CTRL_CMD_LINK_CONTROL, move |params| {
            let request: LinkControlRequest = serde_json::from_slice(params)?;
            let id = LinkId::decode(request.link_id)?;
            let sys = sys
                .upgrade()
                .ok_or_else(|| Error::InvalidState("System context is gone.".into()))?;
            let cmd = if request.params.is_null() {
                LinkCmd::new(request.cmd)
            } else {
                LinkCmd::with_params(request.cmd, &request.params)?
            };
            sys.link_control(id, cmd)
        })
    }

    /// Runs the handler registered under `name`.
    ///
    /// Unknown names are answered with `EUNSUPPORTED_CMD`; handler errors
    /// with their status code.
    pub fn dispatch(&self, name: &str, params: &[u8]) -> NetworkCtrlAck {
        let handler = self.handlers.read().get(name).cloned();
        let Some(handler) = handler else {
            tracing::warn!("Unknown network command {name}");
            return NetworkCtrlAck {
                ret: status::EUNSUPPORTED_CMD,
                reply: Vec::new(),
            };
        };
        match handler(params) {
            Ok(reply) => NetworkCtrlAck {
                ret: status::SOK,
                reply,
            },
            Err(err) => {
                tracing::warn!("Network command {name} failed: {err}");
                NetworkCtrlAck {
                    ret: err.status(),
                    reply: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_bounded_and_unique() {
        let ctrl = NetworkCtrl::new();
        let long = "x".repeat(NETWORK_CTRL_MAX_CMD_NAME + 1);
        assert!(matches!(
            ctrl.register(&long, |_| Ok(Vec::new())),
            Err(Error::InvalidParams(_))
        ));
        let exact = "x".repeat(NETWORK_CTRL_MAX_CMD_NAME);
        ctrl.register(&exact, |_| Ok(Vec::new())).unwrap();
        assert!(matches!(
            ctrl.register(&exact, |_| Ok(Vec::new())),
            Err(Error::InvalidState(_))
        ));
        assert!(ctrl.unregister(&exact));
        assert!(!ctrl.is_registered(&exact));
    }

    #[test]
    fn handler_errors_become_status_codes() {
        let ctrl = NetworkCtrl::new();
        ctrl.register("fail", |_| Err(Error::Timeout)).unwrap();
        let ack = ctrl.dispatch("fail", &[]);
        assert_eq!(ack.ret, status::ETIMEOUT);
        assert!(matches!(ack.into_result(), Err(Error::Timeout)));
        assert_eq!(ctrl.dispatch("nope", &[]).ret, status::EUNSUPPORTED_CMD);
    }
}
