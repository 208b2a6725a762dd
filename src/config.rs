// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the targets file that hostenv uses to figure out
//! where a deployment target lives and how to reach it. File I/O is left to
//! the caller to figure out.
//!
//! # General Layout
//!
//! The targets file is a TOML document with one table per named target:
//!
//! ```toml
//! [target.production]
//! host = "app.example.com"
//! user = "deploy"
//! port = 22
//! identity = "~/.ssh/deploy_ed25519"
//! work_dir = "~/apps/site"
//! ```
//!
//! A target without a host is a __local target__, whose working directory is
//! a directory on this machine instead of a directory on a remote host.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// Layout of the targets file.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct TargetsFile {
    /// Named deployment targets.
    #[serde(rename = "target", default)]
    pub targets: BTreeMap<String, Target>,
}

impl TargetsFile {
    /// Lookup target by name.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownTarget`] if no target has that name.
    pub fn get(&self, name: impl AsRef<str>) -> Result<&Target> {
        self.targets
            .get(name.as_ref())
            .ok_or_else(|| ConfigError::UnknownTarget(name.as_ref().to_string()))
    }
}

impl FromStr for TargetsFile {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut file: TargetsFile = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;
        for target in file.targets.values_mut() {
            target.expand()?;
        }

        Ok(file)
    }
}

impl Display for TargetsFile {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Deployment target settings.
///
/// Every field is optional so that a target from the targets file can be
/// layered with ad-hoc overrides from the command line.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Target {
    /// Remote host to reach over SSH. Local target if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Login user on remote host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// SSH port of remote host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Private key to authenticate with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<PathBuf>,

    /// Working directory holding the environment file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

impl Target {
    /// Layer another target on top of this one.
    ///
    /// Any field set in `overrides` replaces the matching field of `self`.
    pub fn merge(mut self, overrides: Target) -> Self {
        if overrides.host.is_some() {
            self.host = overrides.host;
        }

        if overrides.user.is_some() {
            self.user = overrides.user;
        }

        if overrides.port.is_some() {
            self.port = overrides.port;
        }

        if overrides.identity.is_some() {
            self.identity = overrides.identity;
        }

        if overrides.work_dir.is_some() {
            self.work_dir = overrides.work_dir;
        }

        self
    }

    /// Layer unexpanded overrides on top of this target, then expand them.
    ///
    /// Overrides get expanded according to where the merged target lives, so
    /// a working directory like `~/site` given for a remote target is left
    /// for the remote shell to expand.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if expansion fails.
    pub fn layer(self, mut overrides: Target) -> Result<Self> {
        let local = self.is_local() && overrides.is_local();
        overrides.expand_as(local)?;

        Ok(self.merge(overrides))
    }

    /// Check if target lives on this machine.
    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    /// Perform shell expansion on fields that refer to local paths.
    ///
    /// The working directory of a remote target is left alone so that the
    /// remote shell gets to expand it.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if expansion fails.
    pub fn expand(&mut self) -> Result<()> {
        self.expand_as(self.is_local())
    }

    fn expand_as(&mut self, local: bool) -> Result<()> {
        if let Some(identity) = &self.identity {
            self.identity = Some(PathBuf::from(
                shellexpand::full(identity.to_string_lossy().as_ref())?.into_owned(),
            ));
        }

        if local {
            if let Some(work_dir) = &self.work_dir {
                self.work_dir = Some(shellexpand::full(work_dir)?.into_owned());
            }
        }

        Ok(())
    }
}

impl Display for Target {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let work_dir = self.work_dir.as_deref().unwrap_or(".");
        match &self.host {
            Some(host) => match &self.user {
                Some(user) => write!(fmt, "{user}@{host}:{work_dir}"),
                None => write!(fmt, "{host}:{work_dir}"),
            },
            None => write!(fmt, "{work_dir}"),
        }
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Named target does not exist in targets file.
    #[error("no target named {0:?} in targets file")]
    UnknownTarget(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
