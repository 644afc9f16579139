//! Command line and `btcnode.conf` parsing.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use btcnode_chainstate::block_store::DEFAULT_MAX_CHUNK_SIZE;
use btcnode_consensus::{chain_params, hash256_from_hex, Hash256, Network};

use crate::chain_manager::{DEFAULT_BLOCK_BATCH, DEFAULT_HEADER_CHUNK};
use crate::logging;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "btcnode.conf";
pub const DEFAULT_MAX_PEERS: usize = 8;

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub connect: Vec<SocketAddr>,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub max_chunk_size: u64,
    pub header_chunk: i32,
    pub block_batch: usize,
    /// 0 lets rayon pick one worker per core.
    pub verify_workers: usize,
    pub banned_hashes: Vec<Hash256>,
    pub max_peers: usize,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network: Option<Network> = None;
    let mut connect: Vec<String> = Vec::new();
    let mut log_level: Option<logging::Level> = None;
    let mut log_format: Option<logging::Format> = None;
    let mut log_timestamps: Option<bool> = None;
    let mut max_chunk_mb: Option<u64> = None;
    let mut header_chunk: Option<i32> = None;
    let mut block_batch: Option<usize> = None;
    let mut verify_workers: Option<usize> = None;
    let mut banhashes: Vec<String> = Vec::new();
    let mut max_peers: Option<usize> = None;
    let mut args = raw_args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "help" | "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "version" | "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                network = Some(Network::parse(&value).ok_or_else(|| {
                    format!(
                        "invalid network '{value}' (expected mainnet|testnet|regtest)\n{}",
                        usage()
                    )
                })?);
            }
            "--connect" => connect.push(next_value(&mut args, "--connect")?),
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = Some(
                    logging::Level::parse(&value)
                        .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?,
                );
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = Some(
                    logging::Format::parse(&value)
                        .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?,
                );
            }
            "--no-log-timestamps" => log_timestamps = Some(false),
            "--max-chunk-mb" => {
                let value = next_value(&mut args, "--max-chunk-mb")?;
                max_chunk_mb = Some(parse_positive(&value, "--max-chunk-mb")?);
            }
            "--header-chunk" => {
                let value = next_value(&mut args, "--header-chunk")?;
                header_chunk = Some(parse_positive(&value, "--header-chunk")?);
            }
            "--block-batch" => {
                let value = next_value(&mut args, "--block-batch")?;
                block_batch = Some(parse_positive(&value, "--block-batch")?);
            }
            "--verify-workers" => {
                let value = next_value(&mut args, "--verify-workers")?;
                verify_workers = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid --verify-workers '{value}'\n{}", usage()))?,
                );
            }
            "--banhash" => banhashes.push(next_value(&mut args, "--banhash")?),
            "--max-peers" => {
                let value = next_value(&mut args, "--max-peers")?;
                max_peers = Some(parse_positive(&value, "--max-peers")?);
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf = load_conf(&conf_file)?.unwrap_or_default();
    let invalid = |key: &str, raw: &str| format!("invalid {key} '{raw}' in {}", conf_file.display());

    if network.is_none() {
        if let Some(raw) = conf_last(&conf, "network") {
            network = Some(Network::parse(raw).ok_or_else(|| invalid("network", raw))?);
        } else if conf_flag(&conf, "regtest").map_err(|raw| invalid("regtest", &raw))? {
            network = Some(Network::Regtest);
        } else if conf_flag(&conf, "testnet").map_err(|raw| invalid("testnet", &raw))? {
            network = Some(Network::Testnet);
        }
    }
    let network = network.unwrap_or(Network::Mainnet);
    let params = chain_params(network);

    if log_level.is_none() {
        if let Some(raw) = conf_last(&conf, "loglevel") {
            log_level = Some(logging::Level::parse(raw).ok_or_else(|| invalid("loglevel", raw))?);
        }
    }
    if log_format.is_none() {
        if let Some(raw) = conf_last(&conf, "logformat") {
            log_format =
                Some(logging::Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?);
        }
    }
    if log_timestamps.is_none() {
        if let Some(raw) = conf_last(&conf, "logtimestamps") {
            log_timestamps = Some(parse_conf_bool(raw).ok_or_else(|| invalid("logtimestamps", raw))?);
        }
    }
    if max_chunk_mb.is_none() {
        if let Some(raw) = conf_last(&conf, "maxchunkmb") {
            max_chunk_mb = Some(parse_positive(raw, "maxchunkmb").map_err(|_| invalid("maxchunkmb", raw))?);
        }
    }
    if header_chunk.is_none() {
        if let Some(raw) = conf_last(&conf, "headerchunk") {
            header_chunk = Some(parse_positive(raw, "headerchunk").map_err(|_| invalid("headerchunk", raw))?);
        }
    }
    if block_batch.is_none() {
        if let Some(raw) = conf_last(&conf, "blockbatch") {
            block_batch = Some(parse_positive(raw, "blockbatch").map_err(|_| invalid("blockbatch", raw))?);
        }
    }
    if verify_workers.is_none() {
        if let Some(raw) = conf_last(&conf, "verifyworkers") {
            verify_workers = Some(raw.parse::<usize>().map_err(|_| invalid("verifyworkers", raw))?);
        }
    }
    if max_peers.is_none() {
        if let Some(raw) = conf_last(&conf, "maxpeers") {
            max_peers = Some(parse_positive(raw, "maxpeers").map_err(|_| invalid("maxpeers", raw))?);
        }
    }
    if connect.is_empty() {
        if let Some(values) = conf.get("connect") {
            connect.extend(values.iter().cloned());
        }
    }
    if let Some(values) = conf.get("banhash") {
        banhashes.extend(values.iter().cloned());
    }

    let mut banned_hashes = Vec::with_capacity(banhashes.len());
    for raw in &banhashes {
        let hash = hash256_from_hex(raw).map_err(|err| format!("invalid banhash '{raw}': {err}"))?;
        if !banned_hashes.contains(&hash) {
            banned_hashes.push(hash);
        }
    }

    Ok(CliAction::Run(Config {
        data_dir,
        conf_path: conf_file,
        network,
        connect: parse_peer_addrs(&connect, params.default_port)?,
        log_level: log_level.unwrap_or(logging::Level::Info),
        log_format: log_format.unwrap_or(logging::Format::Text),
        log_timestamps: log_timestamps.unwrap_or(true),
        max_chunk_size: max_chunk_mb
            .map(mb_to_bytes)
            .unwrap_or(DEFAULT_MAX_CHUNK_SIZE),
        header_chunk: header_chunk.unwrap_or(DEFAULT_HEADER_CHUNK),
        block_batch: block_batch.unwrap_or(DEFAULT_BLOCK_BATCH),
        verify_workers: verify_workers.unwrap_or(0),
        banned_hashes,
        max_peers: max_peers.unwrap_or(DEFAULT_MAX_PEERS),
    }))
}

fn next_value<I>(args: &mut I, flag: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_positive<T>(value: &str, flag: &str) -> Result<T, String>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(parsed),
        _ => Err(format!("invalid {flag} '{value}' (expected a positive integer)")),
    }
}

fn conf_last<'a>(conf: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    conf.get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

/// `Err` carries the raw value when it is not a boolean.
fn conf_flag(conf: &HashMap<String, Vec<String>>, key: &str) -> Result<bool, String> {
    match conf_last(conf, key) {
        Some(raw) => parse_conf_bool(raw).ok_or_else(|| raw.to_string()),
        None => Ok(false),
    }
}

/// Reads `key=value` lines; a bare key means `1` and repeated keys accumulate.
/// A missing file is not an error.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = line[..idx].trim();
        }
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn parse_socket_addr_with_default_port(value: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    None
}

/// Literal addresses first, then a DNS lookup for `host[:port]`.
pub fn resolve_node_addrs(value: &str, default_port: u16) -> Vec<SocketAddr> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }
    if let Some(addr) = parse_socket_addr_with_default_port(value, default_port) {
        return vec![addr];
    }
    let resolved = if value.contains(':') {
        value.to_socket_addrs()
    } else {
        (value, default_port).to_socket_addrs()
    };
    let mut out: Vec<SocketAddr> = match resolved {
        Ok(iter) => iter.collect(),
        Err(_) => Vec::new(),
    };
    out.sort_by_key(|addr| addr.to_string());
    out.dedup();
    out
}

fn parse_peer_addrs(values: &[String], default_port: u16) -> Result<Vec<SocketAddr>, String> {
    let mut addrs = Vec::new();
    let mut seen = HashSet::new();
    for raw in values {
        let resolved = resolve_node_addrs(raw, default_port);
        if resolved.is_empty() {
            return Err(format!("invalid connect address '{raw}'"));
        }
        for addr in resolved {
            if addr.port() != 0 && seen.insert(addr) {
                addrs.push(addr);
            }
        }
    }
    Ok(addrs)
}

fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

pub fn usage() -> String {
    [
        "Usage:",
        "  btcnoded [options]",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --data-dir <path>  Data directory (default: ./data)",
        "  --conf <path>  Config file path (default: <data-dir>/btcnode.conf)",
        "  --network <name>  mainnet|testnet|regtest (default: mainnet)",
        "  --connect <addr>  Only connect to this peer (repeatable)",
        "  --log-level <level>  error|warn|info|debug|trace (default: info)",
        "  --log-format <fmt>  text|json (default: text)",
        "  --no-log-timestamps  Omit timestamps from log lines",
        "  --max-chunk-mb <n>  Maximum block chunk file size in MiB (default: 128)",
        "  --header-chunk <n>  Headers fetched per sync pass (default: 210000)",
        "  --block-batch <n>  Blocks downloaded per pass (default: 500)",
        "  --verify-workers <n>  Block verification threads (default: one per core)",
        "  --banhash <hash>  Never accept a header with this hash (repeatable)",
        "  --max-peers <n>  Outbound peer target (default: 8)",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(values: &[&str]) -> Config {
        match parse_args_from(args(values)).expect("parse") {
            CliAction::Run(config) => config,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(args(&["help"])),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(args(&["--version", "--bogus"])),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn defaults_without_conf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8");
        let config = run_config(&["--data-dir", data_dir]);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.conf_path, dir.path().join(CONF_FILE_NAME));
        assert_eq!(config.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);
        assert_eq!(config.header_chunk, DEFAULT_HEADER_CHUNK);
        assert_eq!(config.block_batch, DEFAULT_BLOCK_BATCH);
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
        assert!(config.connect.is_empty());
        assert!(config.log_timestamps);
    }

    #[test]
    fn cli_overrides_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# local node\nregtest=1\nblockbatch=50 ; smaller batches\nheaderchunk=1000\n\
             connect=127.0.0.1\nconnect=127.0.0.2:9000\nlogtimestamps=0\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_str().expect("utf8");

        let config = run_config(&["--data-dir", data_dir, "--block-batch", "7"]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.block_batch, 7);
        assert_eq!(config.header_chunk, 1000);
        assert!(!config.log_timestamps);
        assert_eq!(
            config.connect,
            vec![
                "127.0.0.1:18444".parse::<SocketAddr>().expect("addr"),
                "127.0.0.2:9000".parse::<SocketAddr>().expect("addr"),
            ]
        );

        let config = run_config(&[
            "--data-dir",
            data_dir,
            "--network",
            "mainnet",
            "--connect",
            "10.0.0.1",
        ]);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(
            config.connect,
            vec!["10.0.0.1:8333".parse::<SocketAddr>().expect("addr")]
        );
    }

    #[test]
    fn banhashes_accumulate_from_both_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file_hash = "00000000000000000000000000000000000000000000000000000000000000aa";
        let cli_hash = "00000000000000000000000000000000000000000000000000000000000000bb";
        fs::write(dir.path().join(CONF_FILE_NAME), format!("banhash={file_hash}\n"))
            .expect("write conf");
        let data_dir = dir.path().to_str().expect("utf8");

        let config = run_config(&["--data-dir", data_dir, "--banhash", cli_hash]);
        assert_eq!(config.banned_hashes.len(), 2);
        assert_eq!(config.banned_hashes[0][0], 0xbb);
        assert_eq!(config.banned_hashes[1][0], 0xaa);
    }

    #[test]
    fn rejects_bad_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8");
        for bad in [
            vec!["--network", "signet"],
            vec!["--block-batch", "0"],
            vec!["--header-chunk", "-5"],
            vec!["--log-level", "loud"],
            vec!["--banhash", "xyz"],
            vec!["--max-chunk-mb"],
            vec!["--frobnicate"],
        ] {
            let mut raw = vec!["--data-dir", data_dir];
            raw.extend(bad.iter().copied());
            assert!(parse_args_from(args(&raw)).is_err(), "{bad:?}");
        }

        fs::write(dir.path().join(CONF_FILE_NAME), "testnet=maybe\n").expect("write conf");
        let err = parse_args_from(args(&["--data-dir", data_dir])).expect_err("bad conf");
        assert!(err.contains("testnet"));
    }

    #[test]
    fn conf_parsing_strips_comments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.conf");
        assert!(load_conf(&path).expect("missing is ok").is_none());

        fs::write(&path, "; header\n  Connect = a # first\nconnect=b\nlisten\n=ignored\n")
            .expect("write conf");
        let conf = load_conf(&path).expect("load").expect("present");
        assert_eq!(conf.get("connect"), Some(&vec!["a".to_string(), "b".to_string()]));
        assert_eq!(conf.get("listen"), Some(&vec!["1".to_string()]));
        assert_eq!(conf.len(), 2);
    }

    #[test]
    fn conf_bools_and_addrs() {
        assert_eq!(parse_conf_bool(""), Some(true));
        assert_eq!(parse_conf_bool("Yes"), Some(true));
        assert_eq!(parse_conf_bool("0"), Some(false));
        assert_eq!(parse_conf_bool("2"), None);

        assert_eq!(
            parse_socket_addr_with_default_port("::1", 18_444),
            Some("[::1]:18444".parse().expect("addr"))
        );
        assert_eq!(
            parse_socket_addr_with_default_port("1.2.3.4:1", 18_444),
            Some("1.2.3.4:1".parse().expect("addr"))
        );
        assert_eq!(parse_socket_addr_with_default_port("", 18_444), None);
    }
}
