// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use hostenv::{
    config::{Target, TargetsFile},
    path::default_targets_file,
    ports::{allocated_ports, PortRange, SUPERVISOR_CONF_DIR},
    store::{display_value, Environment, RemoteConfigStore},
    transport::TargetTransport,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use inquire::{Password, Text};
use serde_json::Value;
use std::{fs, path::PathBuf, process::exit};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "hostenv [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let target = self.target.resolve()?;
        info!("target {target}");
        let store = RemoteConfigStore::new(TargetTransport::from(&target));

        match self.command {
            Command::List => run_list(&store),
            Command::Get(opts) => run_get(&store, opts),
            Command::Set(opts) => run_set(&store, opts),
            Command::SetMany(opts) => run_set_many(&store, opts),
            Command::Unset(opts) => run_unset(&store, opts),
            Command::Export(opts) => run_export(&store, opts),
            Command::Ports(opts) => run_ports(&store, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// List every variable of target.
    #[command(override_usage = "hostenv list [options]")]
    List,

    /// Print value of variable, or an empty line if unset.
    #[command(override_usage = "hostenv get [options] <name>")]
    Get(GetOptions),

    /// Set value of variable.
    #[command(override_usage = "hostenv set [options] <name> [<value>]")]
    Set(SetOptions),

    /// Set many variables at once.
    #[command(override_usage = "hostenv set-many [options] <name=value>...")]
    SetMany(SetManyOptions),

    /// Unset variables.
    #[command(override_usage = "hostenv unset [options] <name>...")]
    Unset(UnsetOptions),

    /// Write variables as sourceable shell exports to file on target.
    #[command(override_usage = "hostenv export [options] <path>")]
    Export(ExportOptions),

    /// Print ports not yet allocated to Supervisor programs on target.
    #[command(override_usage = "hostenv ports [options]")]
    Ports(PortsOptions),
}

#[derive(Args, Clone, Debug)]
struct TargetOptions {
    /// Path to targets file.
    #[arg(long, global = true, value_name = "path")]
    pub targets: Option<PathBuf>,

    /// Name of target in targets file.
    #[arg(short, long, global = true, value_name = "name")]
    pub target: Option<String>,

    /// Remote host to reach over SSH.
    #[arg(short = 'H', long, global = true, value_name = "host")]
    pub host: Option<String>,

    /// Login user on remote host.
    #[arg(short, long, global = true, value_name = "user")]
    pub user: Option<String>,

    /// SSH port of remote host.
    #[arg(short, long, global = true, value_name = "port")]
    pub port: Option<u16>,

    /// Private key to authenticate with.
    #[arg(short, long, global = true, value_name = "path")]
    pub identity: Option<PathBuf>,

    /// Working directory holding the environment file.
    #[arg(short = 'C', long, global = true, value_name = "path")]
    pub work_dir: Option<String>,
}

impl TargetOptions {
    fn resolve(self) -> Result<Target> {
        let overrides = Target {
            host: self.host,
            user: self.user,
            port: self.port,
            identity: self.identity,
            work_dir: self.work_dir,
        };

        let base = match self.target {
            Some(name) => {
                let path = match self.targets {
                    Some(path) => path,
                    None => default_targets_file()?,
                };
                debug!("load targets file {:?}", path.display());
                let targets: TargetsFile = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read targets file {:?}", path.display()))?
                    .parse()?;
                targets.get(name)?.clone()
            }
            None => Target::default(),
        };

        Ok(base.layer(overrides)?)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct GetOptions {
    /// Name of variable.
    #[arg(required = true, value_name = "name")]
    pub name: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SetOptions {
    /// Name of variable.
    #[arg(required = true, value_name = "name")]
    pub name: String,

    /// Value of variable. Prompted for if missing.
    #[arg(value_name = "value")]
    pub value: Option<String>,

    /// Hide value while typing it in at the prompt.
    #[arg(short, long)]
    pub secret: bool,

    /// Treat value as JSON scalar instead of string.
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SetManyOptions {
    /// Variables to set.
    #[arg(required = true, value_name = "name=value", value_parser = parse_pair)]
    pub pairs: Vec<(String, String)>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UnsetOptions {
    /// Names of variables to unset.
    #[arg(required = true, value_name = "name")]
    pub names: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ExportOptions {
    /// Path of export file relative to working directory.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PortsOptions {
    /// Ignore ports of these Supervisor programs.
    #[arg(short, long, value_name = "program")]
    pub exclude: Vec<String>,

    /// Lowest port to allocate.
    #[arg(long, value_name = "port", default_value_t = PortRange::default().min)]
    pub min: u16,

    /// Highest port to allocate.
    #[arg(long, value_name = "port", default_value_t = PortRange::default().max)]
    pub max: u16,

    /// Number of ports to print.
    #[arg(short = 'n', long, value_name = "count", default_value_t = 1)]
    pub count: usize,

    /// Supervisor configuration directory on target.
    #[arg(long, value_name = "path", default_value = SUPERVISOR_CONF_DIR)]
    pub conf_dir: String,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_list(store: &RemoteConfigStore) -> Result<()> {
    for (name, value) in store.list()? {
        println!("{name}={}", display_value(&value));
    }

    Ok(())
}

fn run_get(store: &RemoteConfigStore, opts: GetOptions) -> Result<()> {
    println!("{}", store.get(opts.name)?);
    Ok(())
}

fn run_set(store: &RemoteConfigStore, opts: SetOptions) -> Result<()> {
    let value = match opts.value {
        Some(value) => value,
        None if opts.secret => Password::new(&opts.name).without_confirmation().prompt()?,
        None => Text::new(&opts.name).prompt()?,
    };

    let value = if opts.json {
        parse_scalar(&value)?
    } else {
        Value::String(value)
    };

    store.set(opts.name, value)?;
    Ok(())
}

fn run_set_many(store: &RemoteConfigStore, opts: SetManyOptions) -> Result<()> {
    store.set_many(opts.pairs.into_iter().collect::<Environment>())?;
    Ok(())
}

fn run_unset(store: &RemoteConfigStore, opts: UnsetOptions) -> Result<()> {
    store.unset(opts.names)?;
    Ok(())
}

fn run_export(store: &RemoteConfigStore, opts: ExportOptions) -> Result<()> {
    store.export(opts.path)?;
    Ok(())
}

fn run_ports(store: &RemoteConfigStore, opts: PortsOptions) -> Result<()> {
    if opts.min > opts.max {
        bail!("port range {}-{} is empty", opts.min, opts.max);
    }

    let allocated = allocated_ports(store.transport(), &opts.conf_dir, &opts.exclude)?;
    debug!("allocated ports: {allocated:?}");

    let range = PortRange::new(opts.min, opts.max);
    for port in range.take_unallocated(&allocated, opts.count)? {
        println!("{port}");
    }

    Ok(())
}

fn parse_pair(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        Some(_) => Err(format!("missing variable name in {pair:?}")),
        None => Err(format!("expected name=value, got {pair:?}")),
    }
}

fn parse_scalar(value: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(value)? {
        Value::Array(_) | Value::Object(_) => bail!("expected JSON scalar, got {value:?}"),
        scalar => Ok(scalar),
    }
}
