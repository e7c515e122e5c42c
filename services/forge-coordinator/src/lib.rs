// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forge Coordinator Library
//!
//! The coordinator discovers build agents through registries, claims a free
//! one, dispatches a build to it, tails the build's console output live,
//! and retrieves the zipped results when the build finishes.
//!
//! # Modules
//!
//! - [`config`] - Coordinator configuration (template, dirs, timeouts)
//! - [`discovery`] - Registry watching and the find/claim operations
//! - [`availability`] - Fresh agent busy checks
//! - [`build`] - End-to-end orchestration of one distributed build
//! - [`remote_result`] - Per-result-set transfer bookkeeping
//! - [`tail`] - Incremental live-output cursor tracking

pub mod availability;
pub mod build;
pub mod config;
pub mod discovery;
pub mod remote_result;
pub mod tail;
