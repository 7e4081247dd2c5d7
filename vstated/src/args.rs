use clap::{arg, error::ErrorKind, Arg, ArgMatches, Command};
use serde::Deserialize;
use std::{ffi::OsString, fs};
use toml::from_str;
use vstate_hashes::Hash;
use vstate_pruner::config::{GcConfig, MarkerStrategy, PrunerConfig};

/// What the invocation asks for
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Action {
    /// Run the node with its online pruner
    #[default]
    Node,
    /// Offline mark-and-sweep, parameters in [`Args::gc`]
    Gc,
    RecycleList { older_than_secs: Option<u64>, min_size: Option<u64>, limit: usize },
    RecycleRestore { id: Hash },
    RecyclePurge { older_than_secs: Option<u64>, force: bool },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Args {
    // NOTE: it is best if property names match config file fields
    pub appdir: Option<String>,
    pub data_dir: Option<String>,
    pub logdir: Option<String>,
    #[serde(rename = "nologfiles")]
    pub no_log_files: bool,
    #[serde(rename = "loglevel")]
    pub log_level: String,
    pub async_threads: usize,
    pub chain_id: Option<u64>,
    pub yes: bool,
    pub pruner: PrunerConfig,
    pub gc: GcConfig,
    #[serde(skip)]
    pub action: Action,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            appdir: None,
            data_dir: None,
            logdir: None,
            no_log_files: false,
            log_level: "info".into(),
            async_threads: num_cpus::get(),
            chain_id: None,
            yes: false,
            pruner: PrunerConfig::default(),
            gc: GcConfig::default(),
            action: Action::default(),
        }
    }
}

fn node_command(defaults: &Args) -> Command {
    let pruner = &defaults.pruner;
    Command::new("node")
        .about("Run the node and its online state pruner")
        .arg(
            Arg::new("async_threads")
                .short('t')
                .long("async-threads")
                .env("VSTATED_ASYNC_THREADS")
                .value_name("async_threads")
                .value_parser(clap::value_parser!(usize))
                .help(format!("Specify number of async threads (default: {}).", defaults.async_threads)),
        )
        .arg(
            Arg::new("pruner-enable")
                .long("pruner-enable")
                .env("VSTATED_PRUNER_ENABLE")
                .value_name("BOOL")
                .num_args(0..=1)
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool))
                .help(format!("Run the online pruner (default: {}).", pruner.enable)),
        )
        .arg(
            Arg::new("pruner-enable-incremental-sweep")
                .long("pruner-enable-incremental-sweep")
                .env("VSTATED_PRUNER_ENABLE_INCREMENTAL_SWEEP")
                .value_name("BOOL")
                .num_args(0..=1)
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool))
                .help(format!(
                    "Sweep only newly expired stale nodes between full sweeps (default: {}).",
                    pruner.enable_incremental_sweep
                )),
        )
        .arg(
            Arg::new("pruner-interval-s")
                .long("pruner-interval-s")
                .env("VSTATED_PRUNER_INTERVAL_S")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help(format!("Seconds between pruner cycles (default: {}).", pruner.interval_s)),
        )
        .arg(
            Arg::new("pruner-protection-orders")
                .long("pruner-protection-orders")
                .env("VSTATED_PRUNER_PROTECTION_ORDERS")
                .value_name("ORDERS")
                .value_parser(clap::value_parser!(u64))
                .help(format!("Number of most recent roots kept reachable (default: {}).", pruner.protection_orders)),
        )
        .arg(
            Arg::new("pruner-bloom-bits")
                .long("pruner-bloom-bits")
                .env("VSTATED_PRUNER_BLOOM_BITS")
                .value_name("BITS")
                .value_parser(clap::value_parser!(u64))
                .help(format!("Bloom filter size of the pruner marker (default: {}).", pruner.bloom_bits)),
        )
        .arg(
            Arg::new("pruner-scan-batch")
                .long("pruner-scan-batch")
                .env("VSTATED_PRUNER_SCAN_BATCH")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help(format!("Stale index entries read per scan (default: {}).", pruner.scan_batch)),
        )
        .arg(
            Arg::new("pruner-delete-batch")
                .long("pruner-delete-batch")
                .env("VSTATED_PRUNER_DELETE_BATCH")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help(format!("Stale entries processed per atomic write batch (default: {}).", pruner.delete_batch)),
        )
}

fn gc_command(defaults: &Args) -> Command {
    let gc = &defaults.gc;
    Command::new("gc")
        .about("Delete every node unreachable from the protected roots (the node must be stopped)")
        .arg(arg!(--"dry-run" "Report what would be deleted without touching the store"))
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help(format!("Nodes per sweep batch (default: {}).", gc.batch_size)),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help(format!("Worker threads for marking and sweeping (default: {}).", gc.workers)),
        )
        .arg(
            Arg::new("marker-strategy")
                .long("marker-strategy")
                .value_name("STRATEGY")
                .value_parser(["auto", "memory", "persistent"])
                .help(format!("Reachability marker, auto picks by estimated node count (default: {}).", gc.marker_strategy)),
        )
        .arg(arg!(--"recycle-bin" "Keep deleted nodes in the recycle bin"))
        .arg(
            Arg::new("protected-roots-count")
                .long("protected-roots-count")
                .value_name("N")
                .value_parser(clap::value_parser!(u64))
                .help(format!("Number of most recent roots kept reachable (default: {}).", gc.protected_roots_count)),
        )
        .arg(arg!(--force "Allow execute mode to delete nodes"))
        .arg(arg!(--verbose "Log per-level and per-batch progress"))
        .arg(arg!(--json "Print the report as JSON"))
        .arg(arg!(--compact "Compact the database after sweeping"))
        .arg(
            Arg::new("max-error-ratio")
                .long("max-error-ratio")
                .value_name("RATIO")
                .value_parser(clap::value_parser!(f64))
                .help(format!("Failed batch ratio which aborts the sweep (default: {}).", gc.max_error_ratio)),
        )
}

fn recycle_command() -> Command {
    let older_than = || {
        Arg::new("older-than-secs")
            .long("older-than-secs")
            .value_name("SECONDS")
            .value_parser(clap::value_parser!(u64))
            .help("Only entries recycled at least this many seconds ago")
    };
    Command::new("recycle")
        .about("Inspect and manage nodes deleted into the recycle bin")
        .subcommand_required(true)
        .subcommand(
            Command::new("list")
                .about("List recycled nodes")
                .arg(older_than())
                .arg(
                    Arg::new("min-size")
                        .long("min-size")
                        .value_name("BYTES")
                        .value_parser(clap::value_parser!(u64))
                        .help("Only entries of at least this size"),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .help(format!("Maximum entries to list (default: {}).", vstate_pruner::recycle_bin::DEFAULT_LIST_LIMIT)),
                ),
        )
        .subcommand(
            Command::new("restore")
                .about("Put a recycled node back into the store")
                .arg(Arg::new("node-id").required(true).value_parser(clap::value_parser!(Hash)).help("Hex id of the node")),
        )
        .subcommand(
            Command::new("purge")
                .about("Permanently delete recycled nodes")
                .arg(older_than())
                .arg(arg!(--force "Confirm the permanent deletion")),
        )
}

pub fn cli() -> Command {
    let defaults: Args = Default::default();

    Command::new("vstated")
        .about(format!("{} v{}", env!("CARGO_PKG_DESCRIPTION"), env!("CARGO_PKG_VERSION")))
        .version(env!("CARGO_PKG_VERSION"))
        .arg(arg!(-C --configfile <CONFIG_FILE> "Path of config file.").global(true))
        .arg(arg!(-b --appdir <APP_DIR> "Directory to store data.").global(true))
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .env("VSTATED_DATA_DIR")
                .value_name("DATA_DIR")
                .global(true)
                .help("State database directory (default: <appdir>/datadir)."),
        )
        .arg(arg!(--logdir <LOG_DIR> "Directory to log output.").global(true))
        .arg(arg!(--nologfiles "Disable logging to files.").global(true))
        .arg(
            Arg::new("log_level")
                .short('d')
                .long("loglevel")
                .env("VSTATED_LOG_LEVEL")
                .value_name("LEVEL")
                .default_value("info")
                .global(true)
                .help("Logging level for all subsystems {off, error, warn, info, debug, trace}\n-- You may also specify <subsystem>=<level>,<subsystem2>=<level>,... to set the log level for individual subsystems.".to_string()),
        )
        .arg(
            Arg::new("chain-id")
                .long("chain-id")
                .env("VSTATED_CHAIN_ID")
                .value_name("ID")
                .global(true)
                .value_parser(clap::value_parser!(u64))
                .help("Chain id the data directory belongs to."),
        )
        .arg(arg!(--yes "Answer yes to all interactive console questions").global(true))
        .subcommand(node_command(&defaults))
        .subcommand(
            Command::new("db")
                .about("Offline database maintenance")
                .subcommand_required(true)
                .subcommand(gc_command(&defaults))
                .subcommand(recycle_command()),
        )
}

pub fn parse_args() -> Args {
    match Args::parse(std::env::args_os()) {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(err.exit_code());
        }
    }
}

impl Args {
    pub fn parse<I, T>(itr: I) -> Result<Args, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let m: ArgMatches = cli().try_get_matches_from(itr)?;
        let mut defaults: Args = Default::default();

        if let Some(config_file) = m.get_one::<String>("configfile") {
            let config_str = fs::read_to_string(config_file)?;
            defaults = from_str(&config_str).map_err(|toml_error| {
                clap::Error::raw(ErrorKind::ValueValidation, format!("failed parsing config file, reason: {}\n", toml_error.message()))
            })?;
        }

        let mut args = Args {
            appdir: m.get_one::<String>("appdir").cloned().or(defaults.appdir),
            data_dir: m.get_one::<String>("data-dir").cloned().or(defaults.data_dir),
            logdir: m.get_one::<String>("logdir").cloned().or(defaults.logdir),
            no_log_files: arg_match_unwrap_or::<bool>(&m, "nologfiles", defaults.no_log_files),
            log_level: arg_match_unwrap_or::<String>(&m, "log_level", defaults.log_level),
            async_threads: defaults.async_threads,
            chain_id: m.get_one::<u64>("chain-id").copied().or(defaults.chain_id),
            yes: arg_match_unwrap_or::<bool>(&m, "yes", defaults.yes),
            pruner: defaults.pruner,
            gc: defaults.gc,
            action: Action::Node,
        };

        if let Some(sub) = m.subcommand_matches("node") {
            args.async_threads = arg_match_unwrap_or::<usize>(sub, "async_threads", args.async_threads);
            args.apply_pruner_args(sub);
        }

        if let Some(("db", db)) = m.subcommand() {
            match db.subcommand() {
                Some(("gc", sub)) => {
                    args.apply_gc_args(sub)?;
                    args.action = Action::Gc;
                }
                Some(("recycle", recycle)) => {
                    args.action = match recycle.subcommand() {
                        Some(("list", sub)) => Action::RecycleList {
                            older_than_secs: sub.get_one::<u64>("older-than-secs").copied(),
                            min_size: sub.get_one::<u64>("min-size").copied(),
                            limit: sub.get_one::<usize>("limit").copied().unwrap_or(vstate_pruner::recycle_bin::DEFAULT_LIST_LIMIT),
                        },
                        Some(("restore", sub)) => Action::RecycleRestore {
                            id: sub.get_one::<Hash>("node-id").copied().ok_or_else(|| missing("node-id"))?,
                        },
                        Some(("purge", sub)) => Action::RecyclePurge {
                            older_than_secs: sub.get_one::<u64>("older-than-secs").copied(),
                            force: arg_match_unwrap_or::<bool>(sub, "force", false),
                        },
                        _ => return Err(missing("recycle subcommand")),
                    };
                }
                _ => return Err(missing("db subcommand")),
            }
        }

        Ok(args)
    }

    fn apply_pruner_args(&mut self, m: &ArgMatches) {
        let pruner = &mut self.pruner;
        pruner.enable = arg_match_unwrap_or::<bool>(m, "pruner-enable", pruner.enable);
        pruner.enable_incremental_sweep =
            arg_match_unwrap_or::<bool>(m, "pruner-enable-incremental-sweep", pruner.enable_incremental_sweep);
        pruner.interval_s = arg_match_unwrap_or::<u64>(m, "pruner-interval-s", pruner.interval_s);
        pruner.protection_orders = arg_match_unwrap_or::<u64>(m, "pruner-protection-orders", pruner.protection_orders);
        pruner.bloom_bits = arg_match_unwrap_or::<u64>(m, "pruner-bloom-bits", pruner.bloom_bits);
        pruner.scan_batch = arg_match_unwrap_or::<usize>(m, "pruner-scan-batch", pruner.scan_batch);
        pruner.delete_batch = arg_match_unwrap_or::<usize>(m, "pruner-delete-batch", pruner.delete_batch);
    }

    fn apply_gc_args(&mut self, m: &ArgMatches) -> Result<(), clap::Error> {
        let gc = &mut self.gc;
        gc.chain_id = self.chain_id.ok_or_else(|| missing("--chain-id"))?;
        gc.dry_run = arg_match_unwrap_or::<bool>(m, "dry-run", gc.dry_run);
        gc.batch_size = arg_match_unwrap_or::<usize>(m, "batch-size", gc.batch_size);
        gc.workers = arg_match_unwrap_or::<usize>(m, "workers", gc.workers);
        if let Some(strategy) = m.get_one::<String>("marker-strategy") {
            gc.marker_strategy = strategy
                .parse::<MarkerStrategy>()
                .map_err(|err| clap::Error::raw(ErrorKind::InvalidValue, format!("{err}\n")))?;
        }
        gc.use_recycle_bin = arg_match_unwrap_or::<bool>(m, "recycle-bin", gc.use_recycle_bin);
        gc.protected_roots_count = arg_match_unwrap_or::<u64>(m, "protected-roots-count", gc.protected_roots_count);
        gc.force = arg_match_unwrap_or::<bool>(m, "force", gc.force);
        gc.verbose = arg_match_unwrap_or::<bool>(m, "verbose", gc.verbose);
        gc.yes = self.yes || gc.yes;
        gc.json = arg_match_unwrap_or::<bool>(m, "json", gc.json);
        gc.compact = arg_match_unwrap_or::<bool>(m, "compact", gc.compact);
        gc.max_error_ratio = arg_match_unwrap_or::<f64>(m, "max-error-ratio", gc.max_error_ratio);
        Ok(())
    }
}

fn missing(what: &str) -> clap::Error {
    clap::Error::raw(ErrorKind::MissingRequiredArgument, format!("missing {what}\n"))
}

use clap::parser::ValueSource::DefaultValue;
fn arg_match_unwrap_or<T: Clone + Send + Sync + 'static>(m: &ArgMatches, arg_id: &str, default: T) -> T {
    m.get_one::<T>(arg_id).cloned().filter(|_| m.value_source(arg_id) != Some(DefaultValue)).unwrap_or(default)
}
