// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Environment store management and manipulation.
//!
//! Hostenv keeps environment variables for a deployment target inside a
//! small JSON document called the __environment file__. The environment file
//! lives at `.environment` relative to the working directory of the target.
//!
//! # Environment File Layout
//!
//! The environment file is always a single JSON object that maps variable
//! names to string values (or other JSON scalars). A missing environment file
//! is treated the same as an empty object, so there is no separate step to
//! create one. It simply springs into existence on the first write.
//!
//! # Whole-Document Writes
//!
//! Every mutation fetches the entire document, edits it in memory, and writes
//! the entire document back. There is no locking between fetch and store, so
//! two operators racing on the same target can lose updates. Last store wins.
//!
//! # Soft Fetch, Hard Store
//!
//! Fetching is best-effort. If the transport fails to reach the target, the
//! failure is logged and an empty environment is returned, which is exactly
//! what a brand new target looks like. Note that this means a flaky network
//! is indistinguishable from a missing environment file to callers of
//! [`RemoteConfigStore::fetch`]. Storing is not best-effort. Any transport
//! failure during a store is returned to the caller.

use crate::transport::{TargetTransport, Transport, TransportError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, instrument, warn};

/// Name of environment file relative to target's working directory.
pub const ENVIRONMENT_FILE: &str = ".environment";

/// Mapping of environment variable names to values.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, Value>);

impl Environment {
    /// Construct new empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup variable value.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&Value> {
        self.0.get(name.as_ref())
    }

    /// Bind variable to value, overwriting any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Unbind variable, returning its old value.
    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<Value> {
        self.0.remove(name.as_ref())
    }

    /// Merge another environment into this one.
    ///
    /// Variables of `other` overwrite variables of the same name.
    pub fn merge(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    /// Iterate through variables ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Environment
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Environment {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromStr for Environment {
    type Err = StoreError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        // INVARIANT: Environment file is always a JSON object.
        match serde_json::from_str::<Value>(data)? {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(StoreError::NotAnObject(kind_of(&other))),
        }
    }
}

impl Display for Environment {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let data = serde_json::to_string(&self.0).map_err(|_| std::fmt::Error)?;
        fmt.write_str(data.as_str())
    }
}

/// Render variable value as plain text.
///
/// Strings come out as-is without quotes. Every other value comes out in its
/// JSON form.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Environment store of a deployment target.
///
/// Provides read-modify-write access to the environment file of a target
/// through a [`Transport`].
#[derive(Debug)]
pub struct RemoteConfigStore<T = TargetTransport>
where
    T: Transport,
{
    transport: T,
    path: PathBuf,
}

impl<T> RemoteConfigStore<T>
where
    T: Transport,
{
    /// Construct new environment store using default environment file.
    pub fn new(transport: T) -> Self {
        Self::with_path(transport, ENVIRONMENT_FILE)
    }

    /// Construct new environment store using custom environment file.
    pub fn with_path(transport: T, path: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }

    /// Path to environment file relative to target's working directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Underlying transport to target.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fetch entire environment of target.
    ///
    /// A missing environment file yields an empty environment. So does a
    /// transport failure, which gets logged as a warning.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotUtf8`] if environment file is not UTF-8.
    /// - Return [`StoreError::Malformed`] if environment file is not JSON.
    /// - Return [`StoreError::NotAnObject`] if environment file is JSON, but
    ///   not a JSON object.
    #[instrument(skip(self), level = "debug")]
    pub fn fetch(&self) -> Result<Environment> {
        let contents = match self.transport.retrieve(&self.path) {
            Ok(Some(contents)) => contents,
            Ok(None) => {
                debug!("no environment file at {:?}", self.path.display());
                return Ok(Environment::new());
            }
            Err(error) => {
                warn!("cannot fetch environment, assuming none: {error}");
                return Ok(Environment::new());
            }
        };

        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(Environment::new());
        }

        // INVARIANT: Environment file is never decoded lossily.
        std::str::from_utf8(&contents)?.parse()
    }

    /// Store entire environment to target.
    ///
    /// Replaces the whole environment file in one shot.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Transport`] if environment file cannot be
    ///   written.
    #[instrument(skip(self, environment), level = "debug")]
    pub fn store(&self, environment: &Environment) -> Result<()> {
        debug!("store {} variables", environment.len());
        self.transport
            .store(&self.path, environment.to_string().as_bytes())?;

        Ok(())
    }

    /// List every variable of target.
    ///
    /// Fetches the environment anew on each call.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if environment file is malformed.
    pub fn list(&self) -> Result<impl Iterator<Item = (String, Value)>> {
        Ok(self.fetch()?.into_iter())
    }

    /// Get value of variable.
    ///
    /// Returns empty string if variable is not set.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if environment file is malformed.
    #[instrument(skip(self, name), level = "debug")]
    pub fn get(&self, name: impl AsRef<str>) -> Result<String> {
        Ok(self
            .fetch()?
            .get(name)
            .map(display_value)
            .unwrap_or_default())
    }

    /// Set value of variable.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if environment file is malformed, or cannot
    ///   be written.
    #[instrument(skip(self, name, value), level = "debug")]
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let name = name.into();
        let mut environment = self.fetch()?;
        info!("set {name}");
        environment.insert(name, value);
        self.store(&environment)
    }

    /// Set many variables at once.
    ///
    /// Given variables overwrite existing ones, and leave all others alone.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if environment file is malformed, or cannot
    ///   be written.
    #[instrument(skip(self, variables), level = "debug")]
    pub fn set_many(&self, variables: Environment) -> Result<()> {
        let mut environment = self.fetch()?;
        info!("set {} variables", variables.len());
        environment.merge(variables);
        self.store(&environment)
    }

    /// Unset variables.
    ///
    /// Variables that are not set are ignored. Nothing gets written if none of
    /// the variables were set to begin with.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if environment file is malformed, or cannot
    ///   be written.
    #[instrument(skip(self, names), level = "debug")]
    pub fn unset(&self, names: impl IntoIterator<Item = impl AsRef<str>>) -> Result<()> {
        let mut environment = self.fetch()?;
        let mut changed = false;
        for name in names {
            if environment.remove(name.as_ref()).is_some() {
                info!("unset {}", name.as_ref());
                changed = true;
            } else {
                warn!("{} is not set", name.as_ref());
            }
        }

        if !changed {
            return Ok(());
        }

        self.store(&environment)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// All possible error types for environment store interaction.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Environment file is not valid JSON.
    #[error("environment file is not valid JSON")]
    Malformed(#[from] serde_json::Error),

    /// Environment file is not valid UTF-8.
    #[error("environment file is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// Environment file is valid JSON, but not a JSON object.
    #[error("environment file holds a JSON {0}, expected an object")]
    NotAnObject(&'static str),

    /// Transport to target fails.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use simple_test_case::test_case;
    use std::{cell::RefCell, collections::HashMap};

    /// In-memory target with switchable failures.
    #[derive(Debug, Default)]
    struct MemoryTransport {
        files: RefCell<HashMap<PathBuf, Vec<u8>>>,
        fail_retrieve: bool,
        fail_store: bool,
        stores: RefCell<usize>,
    }

    impl MemoryTransport {
        fn with_file(path: &str, contents: &str) -> Self {
            Self::with_bytes(path, contents.as_bytes())
        }

        fn with_bytes(path: &str, contents: &[u8]) -> Self {
            let transport = Self::default();
            transport
                .files
                .borrow_mut()
                .insert(PathBuf::from(path), contents.to_vec());
            transport
        }

        fn failure() -> TransportError {
            TransportError::Syscall {
                program: "ssh".into(),
                code: Some(255),
                stderr: "connection refused".into(),
            }
        }
    }

    impl Transport for MemoryTransport {
        fn retrieve(&self, path: &Path) -> crate::transport::Result<Option<Vec<u8>>> {
            if self.fail_retrieve {
                return Err(Self::failure());
            }

            Ok(self.files.borrow().get(path).cloned())
        }

        fn store(&self, path: &Path, contents: &[u8]) -> crate::transport::Result<()> {
            if self.fail_store {
                return Err(Self::failure());
            }

            *self.stores.borrow_mut() += 1;
            self.files
                .borrow_mut()
                .insert(path.to_path_buf(), contents.to_vec());
            Ok(())
        }

        fn run(&self, _command: &str) -> crate::transport::Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn fetch_without_environment_file_is_empty() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::default());
        assert_eq!(store.fetch()?, Environment::new());
        assert_eq!(store.get("FOO")?, "");

        Ok(())
    }

    #[test]
    fn fetch_with_unreachable_target_is_empty() -> anyhow::Result<()> {
        let transport = MemoryTransport {
            fail_retrieve: true,
            ..MemoryTransport::with_file(ENVIRONMENT_FILE, r#"{"FOO":"bar"}"#)
        };
        let store = RemoteConfigStore::new(transport);
        assert_eq!(store.fetch()?, Environment::new());

        Ok(())
    }

    #[test_case("[1, 2]", "array"; "array")]
    #[test_case("\"FOO\"", "string"; "string")]
    #[test_case("null", "null"; "null")]
    #[test]
    fn fetch_rejects_non_object(contents: &str, kind: &str) {
        let store = RemoteConfigStore::new(MemoryTransport::with_file(ENVIRONMENT_FILE, contents));
        match store.fetch() {
            Err(StoreError::NotAnObject(result)) => pretty_assertions::assert_eq!(result, kind),
            other => panic!("expected non-object error, got {other:?}"),
        }
    }

    #[test]
    fn fetch_rejects_malformed_json() {
        let store = RemoteConfigStore::new(MemoryTransport::with_file(ENVIRONMENT_FILE, "{FOO"));
        assert!(matches!(store.fetch(), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn invalid_utf8_is_never_overwritten() {
        let contents = b"{\"KEY\":\"caf\xe9\"}";
        let store = RemoteConfigStore::new(MemoryTransport::with_bytes(ENVIRONMENT_FILE, contents));

        assert!(matches!(store.fetch(), Err(StoreError::NotUtf8(_))));
        assert!(matches!(store.set("FOO", "bar"), Err(StoreError::NotUtf8(_))));
        assert_eq!(*store.transport().stores.borrow(), 0);
        assert_eq!(
            store.transport().files.borrow().get(Path::new(ENVIRONMENT_FILE)),
            Some(&contents.to_vec())
        );
    }

    #[test]
    fn whitespace_only_document_is_empty() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::with_file(ENVIRONMENT_FILE, " \n\t"));
        assert_eq!(store.fetch()?, Environment::new());

        Ok(())
    }

    #[test]
    fn store_then_fetch_round_trip() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::default());
        let environment = Environment::from_iter([
            ("FOO", json!("bar")),
            ("WORKERS", json!(4)),
            ("DEBUG", json!(false)),
            ("EMPTY", json!("")),
        ]);

        store.store(&environment)?;
        assert_eq!(store.fetch()?, environment);

        Ok(())
    }

    #[test]
    fn set_leaves_other_variables_alone() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::with_file(
            ENVIRONMENT_FILE,
            r#"{"FOO":"bar","QUX":"1"}"#,
        ));

        store.set("FOO", "baz")?;
        store.set("NEW", "value")?;

        let expect = Environment::from_iter([("FOO", "baz"), ("QUX", "1"), ("NEW", "value")]);
        assert_eq!(store.fetch()?, expect);

        Ok(())
    }

    #[test]
    fn set_many_overwrites_overlapping_variables() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::with_file(
            ENVIRONMENT_FILE,
            r#"{"FOO":"bar","KEEP":"me"}"#,
        ));

        store.set_many(Environment::from_iter([("FOO", "baz"), ("QUX", "1")]))?;

        let expect = Environment::from_iter([("FOO", "baz"), ("KEEP", "me"), ("QUX", "1")]);
        assert_eq!(store.fetch()?, expect);

        Ok(())
    }

    #[test]
    fn failed_store_keeps_old_document() -> anyhow::Result<()> {
        let transport = MemoryTransport {
            fail_store: true,
            ..MemoryTransport::with_file(ENVIRONMENT_FILE, r#"{"FOO":"bar"}"#)
        };
        let store = RemoteConfigStore::new(transport);

        assert!(matches!(
            store.set("FOO", "baz"),
            Err(StoreError::Transport(_))
        ));
        assert_eq!(store.get("FOO")?, "bar");

        Ok(())
    }

    #[test]
    fn unset_removes_only_named_variables() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::with_file(
            ENVIRONMENT_FILE,
            r#"{"FOO":"bar","QUX":"1"}"#,
        ));

        store.unset(["FOO", "MISSING"])?;
        assert_eq!(store.fetch()?, Environment::from_iter([("QUX", "1")]));
        assert_eq!(*store.transport().stores.borrow(), 1);

        // Nothing to unset, nothing to write.
        store.unset(["MISSING"])?;
        assert_eq!(*store.transport().stores.borrow(), 1);

        Ok(())
    }

    #[test]
    fn list_fetches_anew_each_call() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::default());
        assert_eq!(store.list()?.count(), 0);

        store.set("FOO", "bar")?;
        let result = store.list()?.collect::<Vec<_>>();
        assert_eq!(result, vec![("FOO".to_string(), json!("bar"))]);

        Ok(())
    }

    #[test_case(json!("bar"), "bar"; "string")]
    #[test_case(json!(8000), "8000"; "number")]
    #[test_case(json!(true), "true"; "boolean")]
    #[test_case(json!(null), "null"; "null")]
    #[test]
    fn display_value_as_plain_text(value: Value, expect: &str) {
        pretty_assertions::assert_eq!(display_value(&value), expect);
    }

    #[test]
    fn first_use_scenario() -> anyhow::Result<()> {
        let store = RemoteConfigStore::new(MemoryTransport::default());

        assert_eq!(store.get("FOO")?, "");
        store.set("FOO", "bar")?;
        assert_eq!(store.fetch()?, Environment::from_iter([("FOO", "bar")]));

        store.set_many(Environment::from_iter([("FOO", "baz"), ("QUX", "1")]))?;
        assert_eq!(
            store.fetch()?,
            Environment::from_iter([("FOO", "baz"), ("QUX", "1")])
        );

        Ok(())
    }
}
