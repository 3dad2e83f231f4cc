// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! # Chains
//!
//! Use cases for the [`links`] dataflow engine. A use case is a JSON file
//! listing the links of one chain; this crate turns it into a
//! [`links::Chain`], runs it on a [`links::Platform`] covering every
//! processor it names and reports link statistics.
//!
//! ## Examples
//!
//! ```
//! use std::time::Duration;
//! use chains::{PluginRegistry, UseCase, run};
//!
//! # fn main() -> Result<(), chains::Error> {
//! let usecase = UseCase::from_json_str(r#"{
//!     "name": "null_src_to_null",
//!     "links": [
//!         { "id": "IPU1_0/NULL_SRC_0", "params": {
//!             "out_que": { "next_link": "IPU1_0/NULL_0" },
//!             "channels": [{ "buf_type": "meta_data", "format": "raw",
//!                            "width": 16, "height": 1, "pitch": [16, 0] }],
//!             "interval_ms": 2
//!         } },
//!         { "id": "IPU1_0/NULL_0", "params": {
//!             "in_queues": [{ "prev_link_id": "IPU1_0/NULL_SRC_0" }]
//!         } }
//!     ]
//! }"#)?;
//! let report = run(&usecase, &PluginRegistry::default(), Duration::from_millis(50))?;
//! assert_eq!(report.links.len(), 2);
//! # Ok(())
//! # }
//! ```

mod error;
pub mod plugins;
pub mod runner;
pub mod usecase;

pub use error::{Error, Result};
pub use plugins::PluginRegistry;
pub use runner::{LinkReport, RunReport, run};
pub use usecase::UseCase;
