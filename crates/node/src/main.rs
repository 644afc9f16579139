use btcnode_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod block_downloader;
pub mod chain_manager;
pub mod config;
pub mod messages;
pub mod p2p;
pub mod peer;
pub mod peer_manager;
#[cfg(test)]
mod test_support;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use btcnode_consensus::chain_params;
use fs2::FileExt;

use crate::chain_manager::{ChainManager, ChainManagerConfig};
use crate::config::{parse_args, usage, CliAction, Config};
use crate::peer_manager::{PeerManager, BANLIST_FILE_NAME};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const IDLE_SLEEP_SECS: u64 = 2;

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another btcnoded may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another btcnoded may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("btcnode {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;

    let params = chain_params(config.network);
    let peers = Arc::new(PeerManager::new(
        params.message_start,
        params.default_port,
        params.dns_seeds,
        config.connect.clone(),
        config.max_peers,
    ));
    let banlist_path = config.data_dir.join(BANLIST_FILE_NAME);
    match peers.bans().load(&banlist_path) {
        Ok(0) => {}
        Ok(count) => log_info!("loaded {count} banned peers from {}", banlist_path.display()),
        Err(err) => log_warn!("ignoring {}: {err}", banlist_path.display()),
    }

    let mut manager_config = ChainManagerConfig::new(&config.data_dir);
    manager_config.max_chunk_size = config.max_chunk_size;
    manager_config.header_chunk = config.header_chunk;
    manager_config.verify_workers = config.verify_workers;
    manager_config.banned_hashes = config.banned_hashes.clone();
    let mut manager = ChainManager::open(params, manager_config, Arc::clone(&peers))
        .map_err(|err| err.to_string())?;

    let mut saved_revision = peers.bans().revision();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result = loop {
        let step = async {
            if peers.maintain(manager.height()).await == 0 {
                log_debug!("no peers connected");
                return Ok(false);
            }
            let headers_moved = manager.sync_headers_from_peers().await?;
            let stored = manager.download_blocks(config.block_batch).await?;
            Ok::<bool, chain_manager::SyncError>(headers_moved || stored > 0)
        };
        let progressed = tokio::select! {
            _ = &mut shutdown => break Ok(()),
            result = step => result,
        };

        let revision = peers.bans().revision();
        if revision != saved_revision {
            match peers.bans().save(&banlist_path) {
                Ok(()) => saved_revision = revision,
                Err(err) => log_warn!("failed to persist {}: {err}", banlist_path.display()),
            }
        }

        match progressed {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => {
                log_error!("{err}");
                break Err(err.to_string());
            }
        }
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(IDLE_SLEEP_SECS)) => {}
        }
    };

    log_info!(
        "shutting down at header {} / block {}",
        manager.height(),
        manager.block_height()
    );
    peers.disconnect_all();
    if let Err(err) = peers.bans().save(&banlist_path) {
        log_warn!("failed to persist {}: {err}", banlist_path.display());
    }
    result
}
