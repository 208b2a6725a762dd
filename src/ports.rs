// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Port allocation for Supervisor managed programs.
//!
//! Deployment targets commonly run several gunicorn programs side by side
//! under Supervisor, each bound to its own local port. Picking a port for a
//! new program means finding one that no existing program config mentions.
//!
//! # Supervisor Program Layout
//!
//! Hostenv scans every `*.conf` file in the Supervisor configuration
//! directory for lines mentioning gunicorn, and extracts the port out of the
//! `host:port` bind address. Two layouts are understood:
//!
//! ```text
//! command=/srv/venv/bin/python manage.py run_gunicorn 127.0.0.1:8001 -w 3
//! command=/srv/venv/bin/gunicorn site.wsgi:application --bind 127.0.0.1:8002
//! ```
//!
//! Anything that does not parse as a port is skipped.

use crate::transport::{quote, Transport, TransportError};

use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Default Supervisor configuration directory.
pub const SUPERVISOR_CONF_DIR: &str = "/etc/supervisor/conf.d";

/// Collect ports already allocated to Supervisor programs on target.
///
/// Program configs named in `excluded_programs` are ignored, which is handy
/// when redeploying a program that should be able to keep its own port.
///
/// # Errors
///
/// - Return [`PortsError::Transport`] if scan cannot be run on target.
#[instrument(skip(transport, excluded_programs), level = "debug")]
pub fn allocated_ports(
    transport: &impl Transport,
    conf_dir: &str,
    excluded_programs: impl IntoIterator<Item = impl AsRef<str>>,
) -> Result<BTreeSet<u16>> {
    let command = scan_command(conf_dir, excluded_programs);
    debug!("scan for allocated ports: {command}");

    // INVARIANT: Exit status 1 means no matches, or no program configs at all.
    let output = match transport.run(&command) {
        Ok(output) => output,
        Err(error) if error.exit_code() == Some(1) => String::new(),
        Err(error) => return Err(error.into()),
    };

    Ok(parse_allocated_ports(&output))
}

/// Extract allocated ports out of grep output.
///
/// Each line looks like `<file>:<config line>`. The port is the first word
/// after the colon of the bind address.
pub fn parse_allocated_ports(output: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for line in output.lines() {
        let fields = line.split(':').collect::<Vec<_>>();

        // Old layout binds at third field, new layout at fourth.
        for field in fields.iter().skip(2).take(2) {
            if let Some(port) = field
                .split_whitespace()
                .next()
                .and_then(|word| word.parse::<u16>().ok())
            {
                ports.insert(port);
            }
        }
    }

    ports
}

fn scan_command(
    conf_dir: &str,
    excluded_programs: impl IntoIterator<Item = impl AsRef<str>>,
) -> String {
    // Unmatched glob stays literal, so bail out before grep trips over it.
    let conf_dir = conf_dir.trim_end_matches('/');
    let mut command = format!("set -- {}/*.conf && [ -e \"$1\" ] && grep -H", quote(conf_dir));
    for program in excluded_programs {
        command.push_str(" --exclude=");
        command.push_str(quote(format!("{}.conf", program.as_ref())).as_str());
    }

    command.push_str(" gunicorn \"$@\"");
    command
}

/// Inclusive range of ports to allocate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    /// Construct new port range.
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Lazily walk through ports of range that are not allocated.
    pub fn unallocated<'a>(
        &self,
        allocated: &'a BTreeSet<u16>,
    ) -> impl Iterator<Item = u16> + 'a {
        (self.min..=self.max).filter(move |port| !allocated.contains(port))
    }

    /// Take first `count` unallocated ports of range.
    ///
    /// # Errors
    ///
    /// - Return [`PortsError::Exhausted`] if range does not have enough
    ///   unallocated ports left.
    pub fn take_unallocated(&self, allocated: &BTreeSet<u16>, count: usize) -> Result<Vec<u16>> {
        let ports = self.unallocated(allocated).take(count).collect::<Vec<_>>();
        if ports.len() < count {
            return Err(PortsError::Exhausted {
                min: self.min,
                max: self.max,
            });
        }

        Ok(ports)
    }

    /// First unallocated port of range.
    ///
    /// # Errors
    ///
    /// - Return [`PortsError::Exhausted`] if every port is allocated.
    pub fn first_unallocated(&self, allocated: &BTreeSet<u16>) -> Result<u16> {
        self.unallocated(allocated)
            .next()
            .ok_or(PortsError::Exhausted {
                min: self.min,
                max: self.max,
            })
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(8000, 8999)
    }
}

/// Port allocation error types.
#[derive(Debug, thiserror::Error)]
pub enum PortsError {
    /// Every port in range is already allocated.
    #[error("all ports in range {min}-{max} are already used")]
    Exhausted { min: u16, max: u16 },

    /// Scan cannot be run on target.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Friendly result alias :3
pub type Result<T, E = PortsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;
    use std::fs;

    #[test]
    fn parse_both_gunicorn_layouts() {
        let output = indoc! {r#"
            /etc/supervisor/conf.d/old.conf:command=/srv/venv/bin/python manage.py run_gunicorn 127.0.0.1:8001 -w 3
            /etc/supervisor/conf.d/new.conf:command=/srv/venv/bin/gunicorn site.wsgi:application --bind 127.0.0.1:8002
            /etc/supervisor/conf.d/sock.conf:command=/srv/venv/bin/gunicorn site.wsgi:application --bind unix:/tmp/g.sock
            /etc/supervisor/conf.d/junk.conf:; gunicorn is great
        "#};

        let result = parse_allocated_ports(output);
        let expect = BTreeSet::from([8001, 8002]);

        assert_eq!(result, expect);
    }

    #[test]
    fn scan_command_excludes_programs() {
        let result = scan_command("/etc/supervisor/conf.d/", ["blog", "shop"]);
        let expect = concat!(
            "set -- '/etc/supervisor/conf.d'/*.conf && [ -e \"$1\" ] && ",
            "grep -H --exclude='blog.conf' --exclude='shop.conf' gunicorn \"$@\"",
        );

        assert_eq!(result, expect);
    }

    #[test_case(&[], 8000; "nothing allocated")]
    #[test_case(&[8000, 8001, 8003], 8002; "gap in allocation")]
    #[test]
    fn first_unallocated_port(allocated: &[u16], expect: u16) {
        let allocated = allocated.iter().copied().collect::<BTreeSet<_>>();
        let result = PortRange::default().first_unallocated(&allocated);
        assert!(matches!(result, Ok(port) if port == expect));
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let range = PortRange::new(8000, 8002);
        let allocated = BTreeSet::from([8000, 8001, 8002]);

        assert!(matches!(
            range.first_unallocated(&allocated),
            Err(PortsError::Exhausted { min: 8000, max: 8002 })
        ));
        assert!(range.unallocated(&allocated).next().is_none());
    }

    #[test]
    fn take_unallocated_skips_allocated() -> anyhow::Result<()> {
        let range = PortRange::new(8000, 8005);
        let allocated = BTreeSet::from([8001, 8003]);

        assert_eq!(range.take_unallocated(&allocated, 3)?, vec![8000, 8002, 8004]);
        assert!(range.take_unallocated(&allocated, 5).is_err());

        Ok(())
    }

    #[sealed_test]
    fn scan_supervisor_configs_on_target() -> anyhow::Result<()> {
        fs::create_dir("conf.d")?;
        fs::write(
            "conf.d/blog.conf",
            "[program:blog]\ncommand=/srv/bin/gunicorn blog.wsgi:application --bind 127.0.0.1:8000\n",
        )?;
        fs::write(
            "conf.d/shop.conf",
            "[program:shop]\ncommand=/srv/bin/python manage.py run_gunicorn 127.0.0.1:8001\n",
        )?;
        let transport = LocalTransport::new(".");

        assert_eq!(
            allocated_ports(&transport, "conf.d", Vec::<String>::new())?,
            BTreeSet::from([8000, 8001])
        );
        assert_eq!(
            allocated_ports(&transport, "conf.d", ["shop"])?,
            BTreeSet::from([8000])
        );
        assert_eq!(
            allocated_ports(&transport, "conf.d", ["blog", "shop"])?,
            BTreeSet::new()
        );

        Ok(())
    }

    #[sealed_test]
    fn scan_without_program_configs_is_empty() -> anyhow::Result<()> {
        let transport = LocalTransport::new(".");

        fs::create_dir("conf.d")?;
        assert_eq!(
            allocated_ports(&transport, "conf.d", Vec::<String>::new())?,
            BTreeSet::new()
        );

        // Missing directory is treated the same.
        assert_eq!(
            allocated_ports(&transport, "missing", Vec::<String>::new())?,
            BTreeSet::new()
        );

        Ok(())
    }
}
