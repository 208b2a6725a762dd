// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Environment variables for deployment targets.
//!
//! Hostenv keeps the environment variables of a deployment target in a small
//! JSON document that lives right inside the target's working directory. All
//! access to the target goes through a [`transport::Transport`], which is
//! normally the system's `ssh` binary.
//!
//! # See Also
//!
//! 1. [`store::RemoteConfigStore`]
//! 2. [`config::Target`]

pub mod config;
pub mod export;
pub mod path;
pub mod ports;
pub mod store;
pub mod transport;
