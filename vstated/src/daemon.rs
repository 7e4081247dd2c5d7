use std::{path::PathBuf, sync::Arc};

use thiserror::Error;
use vstate_core::{
    info,
    log::init_logger,
    signals::Signals,
    task::{runtime::AsyncRuntime, tick::TickService},
    time::unix_now,
    trace,
};
use vstate_database::prelude::{ConnBuilder, StoreError, DB};
use vstate_hashes::Hash;
use vstate_pruner::{
    counters::PrunerCounters,
    errors::PruneError,
    gc::GarbageCollector,
    pruner::Builder as PrunerBuilder,
    recycle_bin::{RecycleBinStore, RecycleFilter},
};
use vstate_store::{PrunableStore, StateStore};

use crate::args::{Action, Args};

const DEFAULT_DATA_DIR: &str = "datadir";
const DEFAULT_LOG_DIR: &str = "logs";
const DB_FILES_LIMIT: i32 = 1024;

/// Exit code of a gc pass which completed but was not clean
pub const EXIT_NOT_CLEAN: i32 = 2;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("{0}")]
    Prune(#[from] PruneError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Runtime(String),
}

pub type DaemonResult<T> = Result<T, DaemonError>;

fn get_home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    return dirs::data_local_dir().unwrap_or_default();
    #[cfg(not(target_os = "windows"))]
    return dirs::home_dir().unwrap_or_default();
}

/// Get the default application directory.
pub fn get_app_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    return get_home_dir().join("vstate");
    #[cfg(not(target_os = "windows"))]
    return get_home_dir().join(".vstate");
}

/// Get the application directory from the supplied [`Args`], expanding `~`.
pub fn get_app_dir_from_args(args: &Args) -> PathBuf {
    let home = get_home_dir();
    let app_dir = args.appdir.clone().unwrap_or_default().replace('~', &home.to_string_lossy());
    if app_dir.is_empty() { get_app_dir() } else { PathBuf::from(app_dir) }
}

/// The state database directory, `--data-dir` or `<appdir>/datadir`
pub fn get_db_dir_from_args(args: &Args) -> PathBuf {
    match &args.data_dir {
        Some(data_dir) if !data_dir.is_empty() => PathBuf::from(data_dir.replace('~', &get_home_dir().to_string_lossy())),
        _ => get_app_dir_from_args(args).join(DEFAULT_DATA_DIR),
    }
}

pub fn get_log_dir(args: &Args) -> Option<String> {
    if args.no_log_files {
        return None;
    }
    let log_dir = args.logdir.clone().map(PathBuf::from).unwrap_or_else(|| get_app_dir_from_args(args).join(DEFAULT_LOG_DIR));
    Some(log_dir.to_string_lossy().into_owned())
}

/// Asks the user and returns whether the answer was "y" or "yes". Always true when `approve` is set.
pub fn get_user_approval(message: &str, approve: bool) -> bool {
    if approve {
        return true;
    }
    println!("{} [y/N]", message);
    let mut input = String::new();
    match std::io::stdin().read_line(&mut input) {
        Ok(_) => {
            let answer = input.trim().to_lowercase();
            answer == "y" || answer == "yes"
        }
        Err(error) => {
            println!("Error reading from console: {error}");
            false
        }
    }
}

fn open_db(args: &Args, create_if_missing: bool) -> DaemonResult<Arc<DB>> {
    let db_dir = get_db_dir_from_args(args);
    if !create_if_missing && !db_dir.exists() {
        return Err(DaemonError::Config(format!("no database found at {}", db_dir.display())));
    }
    info!("Opening the state database at {}", db_dir.display());
    Ok(ConnBuilder::default()
        .with_db_path(db_dir)
        .with_create_if_missing(create_if_missing)
        .with_parallelism(num_cpus::get())
        .with_files_limit(DB_FILES_LIMIT)
        .build()?)
}

/// Runs the parsed invocation and returns the process exit code
pub fn run(args: Args) -> i32 {
    let filters = if matches!(args.action, Action::Gc) && args.gc.verbose {
        format!("{},vstate_pruner=debug", args.log_level)
    } else {
        args.log_level.clone()
    };
    let log_dir = if matches!(args.action, Action::Node) { get_log_dir(&args) } else { None };
    if let Err(err) = init_logger(log_dir.as_deref(), &filters) {
        println!("Failed to initialize the logger: {err}");
        return 1;
    }

    let result = match &args.action {
        Action::Node => run_node(&args),
        Action::Gc => run_gc(&args),
        Action::RecycleList { older_than_secs, min_size, limit } => recycle_list(&args, *older_than_secs, *min_size, *limit),
        Action::RecycleRestore { id } => recycle_restore(&args, *id),
        Action::RecyclePurge { older_than_secs, force } => recycle_purge(&args, *older_than_secs, *force),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            println!("Error: {err}");
            1
        }
    }
}

fn run_gc(args: &Args) -> DaemonResult<i32> {
    // Refuse before opening anything
    if !args.gc.dry_run && !args.gc.force {
        return Err(PruneError::force_required().into());
    }
    let store = Arc::new(StateStore::new(open_db(args, false)?));
    let collector = GarbageCollector::new(store, args.gc.clone(), Arc::new(PrunerCounters::default()))
        .with_confirmation(|prompt| get_user_approval(prompt, false));
    let report = collector.run()?;

    if args.gc.json {
        match report.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => return Err(DaemonError::Runtime(format!("failed serializing the report: {err}"))),
        }
    } else {
        println!("{report}");
    }
    Ok(if report.is_clean() { 0 } else { EXIT_NOT_CLEAN })
}

fn secs_ago(older_than_secs: Option<u64>) -> Option<u64> {
    older_than_secs.map(|secs| unix_now().saturating_sub(secs.saturating_mul(1000)))
}

fn recycle_list(args: &Args, older_than_secs: Option<u64>, min_size: Option<u64>, limit: usize) -> DaemonResult<i32> {
    let bin = RecycleBinStore::new(open_db(args, false)?);
    let filter = RecycleFilter { older_than: secs_ago(older_than_secs), min_size, ..Default::default() };
    let page = bin.list(&filter, None, limit)?;
    let stats = bin.stats()?;
    println!("Recycle bin: {} entries, {} bytes", stats.entries, stats.total_bytes);
    for entry in page.entries.iter() {
        println!(
            "  {}  {} bytes  recycled at {} (cutoff order {})",
            entry.id, entry.record.original_size, entry.record.created_at, entry.record.tx_order
        );
    }
    if let Some(cursor) = page.next_cursor {
        println!("  ... more entries after {cursor}");
    }
    Ok(0)
}

fn recycle_restore(args: &Args, id: Hash) -> DaemonResult<i32> {
    let store = StateStore::new(open_db(args, false)?);
    let bin = RecycleBinStore::new(store.db().clone());
    bin.restore(&store, id)?;
    println!("Restored node {id}");
    Ok(0)
}

fn recycle_purge(args: &Args, older_than_secs: Option<u64>, force: bool) -> DaemonResult<i32> {
    if !force {
        return Err(DaemonError::Prune(PruneError::SafetyGateViolation("purging is permanent, pass --force to proceed".to_string())));
    }
    let bin = RecycleBinStore::new(open_db(args, false)?);
    let purged = bin.purge(&RecycleFilter { older_than: secs_ago(older_than_secs), ..Default::default() })?;
    println!("Purged {purged} recycle bin entries");
    Ok(0)
}

fn run_node(args: &Args) -> DaemonResult<i32> {
    let db = open_db(args, true)?;
    let recorded = StateStore::new(db.clone()).chain_id()?;
    let chain_id = args
        .chain_id
        .or(recorded)
        .ok_or_else(|| DaemonError::Config("--chain-id is required when creating a new data directory".to_string()))?;
    let store = Arc::new(StateStore::init(db, chain_id)?);
    info!("Chain {} state store ready", chain_id);

    let tick_service = Arc::new(TickService::new());
    let pruner = Arc::new(
        PrunerBuilder::new()
            .with_store(store)
            .with_tick_service(tick_service.clone())
            .with_config(args.pruner.clone())
            .build()?,
    );

    let runtime = Arc::new(AsyncRuntime::new(args.async_threads));
    runtime.register(tick_service);
    runtime.register(pruner);

    // Bind the keyboard signal to the runtime
    Arc::new(Signals::new(&runtime)).init().map_err(|err| DaemonError::Runtime(format!("failed binding signals: {err}")))?;

    runtime.run().map_err(|err| DaemonError::Runtime(err.to_string()))?;
    trace!("async runtime returned");
    info!("vstated has stopped...");
    Ok(0)
}
