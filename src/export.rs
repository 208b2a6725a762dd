// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shell export files.
//!
//! Processes on a deployment target usually cannot read the environment file
//! directly. Instead, hostenv can render the environment as a file full of
//! `export NAME='value'` lines that a POSIX shell can source right before
//! starting up a process.

use crate::{
    store::{display_value, Environment, RemoteConfigStore, Result},
    transport::{quote, Transport},
};

use std::path::Path;
use tracing::{info, instrument, warn};

/// Render environment as sourceable shell exports.
///
/// Values are single quoted, so nothing gets expanded when the file is
/// sourced. Variables whose names are not valid shell identifiers are
/// skipped.
pub fn render_exports(environment: &Environment) -> String {
    let mut out = String::new();
    for (name, value) in environment.iter() {
        if !is_shell_identifier(name) {
            warn!("skip {name:?}, not a valid shell variable name");
            continue;
        }

        out.push_str(format!("export {name}={}\n", quote(display_value(value))).as_str());
    }

    out
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

impl<T> RemoteConfigStore<T>
where
    T: Transport,
{
    /// Write sourceable shell exports of environment to target.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`](crate::store::StoreError) if environment file
    ///   is malformed, or export file cannot be written.
    #[instrument(skip(self, path), level = "debug")]
    pub fn export(&self, path: impl AsRef<Path>) -> Result<()> {
        let environment = self.fetch()?;
        info!(
            "export {} variables to {:?}",
            environment.len(),
            path.as_ref().display()
        );
        self.transport()
            .store(path.as_ref(), render_exports(&environment).as_bytes())?;

        Ok(())
    }
}
