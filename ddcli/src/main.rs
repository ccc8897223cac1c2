use clap::{CommandFactory, Parser, Subcommand};
use libdomdisco::{
    create_http_client,
    psl::{missing_from, parse_public_suffix_list},
    sources::{fetch_public_suffix_list, fetch_root_zone},
    zone::RootZone,
    CancellationToken, Directory, DiscoverConfig, Discoverer, NameserverConfig, NameserverDiscovery,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    error::Error,
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Default, Deserialize, Serialize)]
struct Config {
    #[serde(default)]
    discovery: DiscoverySettings,
    #[serde(default)]
    nameservers: NameserverSettings,
    #[serde(default)]
    tlds: TldConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct DiscoverySettings {
    timeout_secs: f64,
    chunk_size: usize,
    probe_deadline_secs: Option<f64>,
    max_in_flight: Option<usize>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            timeout_secs: 2.0,
            chunk_size: libdomdisco::DEFAULT_CHUNK_SIZE,
            probe_deadline_secs: None,
            max_in_flight: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct NameserverSettings {
    timeout_secs: f64,
    concurrency: usize,
    include_ipv6: bool,
    max_referrals: usize,
}

impl Default for NameserverSettings {
    fn default() -> Self {
        let defaults = NameserverConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs_f64(),
            concurrency: defaults.concurrency,
            include_ipv6: defaults.include_ipv6,
            max_referrals: defaults.max_referrals,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct TldConfig {
    #[serde(default)]
    never: Vec<String>,
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("domdisco").join("config.toml"))
}

fn load_config() -> Config {
    let Some(content) = config_path().and_then(|path| fs::read_to_string(path).ok()) else {
        return Config::default();
    };

    toml::from_str(&content).unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid config file");
        Config::default()
    })
}

fn apply_config_to_directory(mut directory: Directory, config: &Config) -> Directory {
    let never_set: HashSet<String> = config
        .tlds
        .never
        .iter()
        .map(|s| s.trim_end_matches('.').to_lowercase())
        .collect();

    directory.retain(|record| !never_set.contains(record.tld()));
    directory
}

fn get_default_config_toml() -> String {
    r#"# domdisco configuration

[discovery]
# Seconds to wait for each nameserver reply
timeout_secs = 2.0
# Names probed concurrently
chunk_size = 20
# Upper bound in seconds on all attempts for one name under one TLD
# probe_deadline_secs = 10.0
# Probes running at once, each holding one socket (defaults to chunk_size)
# max_in_flight = 256

[nameservers]
timeout_secs = 2.0
concurrency = 64
include_ipv6 = false
max_referrals = 3

[tlds]
# TLDs never probed, even when present in the directory
# never = ["xxx", "adult"]
never = []
"#
    .to_string()
}

fn seconds(value: f64, what: &str) -> CliResult<Duration> {
    if !(value.is_finite() && value > 0.0) {
        return Err(format!("{} must be a positive number of seconds, got {}", what, value).into());
    }
    Ok(Duration::try_from_secs_f64(value)?)
}

fn parse_seconds(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("not a number: {}", s))?;
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err("must be greater than zero".to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "domdisco")]
#[command(about = "Find which TLDs a name is registered under by asking their nameservers", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print the default config to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe names against every TLD of a directory file
    Discover {
        /// Names to look for, without TLD
        #[arg(required_unless_present = "names_file")]
        names: Vec<String>,

        /// Read additional names from a file, one per line
        #[arg(long)]
        names_file: Option<PathBuf>,

        /// JSON directory file (TLD -> nameserver IPs)
        #[arg(long, short = 'd')]
        directory: PathBuf,

        /// Names probed concurrently
        #[arg(long, short = 'c')]
        chunk_size: Option<usize>,

        /// Seconds to wait for each nameserver reply
        #[arg(long, value_parser = parse_seconds)]
        timeout: Option<f64>,

        /// Upper bound in seconds on all attempts for one name under one TLD
        #[arg(long, value_parser = parse_seconds)]
        deadline: Option<f64>,

        /// Probes running at once (defaults to the chunk size)
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Output the whole result as one JSON object
        #[arg(long, conflicts_with = "ndjson")]
        json: bool,

        /// Output one JSON object per name
        #[arg(long, short = 'j')]
        ndjson: bool,
    },

    /// Discover nameserver addresses for TLDs missing from a directory file
    Nameservers {
        /// TLDs to resolve, e.g. co.uk
        #[arg(required = true)]
        tlds: Vec<String>,

        /// JSON directory file holding their parents
        #[arg(long, short = 'd')]
        directory: PathBuf,

        /// Also collect IPv6 nameserver addresses
        #[arg(long)]
        ipv6: bool,
    },

    /// Build a directory file from the root zone and the public suffix list
    Bootstrap {
        /// Where to write the JSON directory
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Read the root zone from a file instead of downloading it
        #[arg(long)]
        root_zone: Option<PathBuf>,

        /// Read the public suffix list from a file instead of downloading it
        #[arg(long)]
        psl: Option<PathBuf>,

        /// Only include root zone TLDs
        #[arg(long)]
        skip_psl: bool,

        /// Also collect IPv6 nameserver addresses
        #[arg(long)]
        ipv6: bool,
    },
}

#[derive(Debug, Serialize)]
struct NameResult<'a> {
    name: &'a str,
    tlds: &'a [String],
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            cancel.cancel();
        }
    });
}

fn load_directory(path: &Path) -> CliResult<Directory> {
    let content = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let data: HashMap<String, Vec<String>> = serde_json::from_str(&content)?;
    let directory = Directory::from_bootstrap(data)?;
    info!(path = %path.display(), tlds = directory.len(), "Loaded directory");
    Ok(directory)
}

fn write_directory(path: &Path, directory: &Directory) -> CliResult {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &directory.to_bootstrap())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn read_names(mut names: Vec<String>, names_file: Option<&Path>) -> CliResult<Vec<String>> {
    if let Some(path) = names_file {
        let content = fs::read_to_string(path)?;
        names.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(names)
}

fn nameserver_config(config: &Config, ipv6: bool) -> CliResult<NameserverConfig> {
    Ok(NameserverConfig {
        timeout: seconds(config.nameservers.timeout_secs, "nameservers.timeout_secs")?,
        concurrency: config.nameservers.concurrency.max(1),
        include_ipv6: ipv6 || config.nameservers.include_ipv6,
        max_referrals: config.nameservers.max_referrals,
    })
}

fn main() -> CliResult {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.print_default_config {
        println!("{}", get_default_config_toml());
        return Ok(());
    }

    if args.write_default_config {
        if let Some(path) = config_path() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, get_default_config_toml())?;
            println!("Default config written to: {}", path.display());
        } else {
            eprintln!("Error: Could not determine config path");
        }
        return Ok(());
    }

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let config = load_config();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        match command {
            Command::Discover {
                names,
                names_file,
                directory,
                chunk_size,
                timeout,
                deadline,
                max_in_flight,
                json,
                ndjson,
            } => {
                let names = read_names(names, names_file.as_deref())?;
                let directory = apply_config_to_directory(load_directory(&directory)?, &config);
                let discover_config = DiscoverConfig {
                    timeout: seconds(timeout.unwrap_or(config.discovery.timeout_secs), "timeout")?,
                    probe_deadline: deadline
                        .or(config.discovery.probe_deadline_secs)
                        .map(|secs| seconds(secs, "probe deadline"))
                        .transpose()?,
                    max_in_flight: max_in_flight.or(config.discovery.max_in_flight),
                };
                let chunk_size = chunk_size.unwrap_or(config.discovery.chunk_size);

                run_discover(directory, discover_config, &names, chunk_size, json, ndjson).await
            }
            Command::Nameservers { tlds, directory, ipv6 } => {
                let directory = load_directory(&directory)?;
                run_nameservers(directory, nameserver_config(&config, ipv6)?, &tlds).await
            }
            Command::Bootstrap {
                output,
                root_zone,
                psl,
                skip_psl,
                ipv6,
            } => {
                let ns_config = nameserver_config(&config, ipv6)?;
                run_bootstrap(&output, root_zone.as_deref(), psl.as_deref(), skip_psl, ns_config).await
            }
        }
    })
}

async fn run_discover(
    directory: Directory,
    config: DiscoverConfig,
    names: &[String],
    chunk_size: usize,
    json: bool,
    ndjson: bool,
) -> CliResult {
    let discoverer = Discoverer::with_config(directory, config);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = discoverer.discover_with_cancel(names, chunk_size, &cancel).await?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &result)?;
        writeln!(out)?;
    } else if ndjson {
        for (name, tlds) in &result {
            let line = serde_json::to_string(&NameResult { name, tlds })?;
            writeln!(out, "{}", line)?;
        }
    } else {
        for domain in result.domains() {
            writeln!(out, "{}", domain)?;
        }
    }
    out.flush()?;
    Ok(())
}

async fn run_nameservers(directory: Directory, config: NameserverConfig, tlds: &[String]) -> CliResult {
    let engine = NameserverDiscovery::with_config(directory, config);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let found = engine.generate_with_cancel(tlds, &cancel).await?;
    for tld in tlds {
        if !found.contains(tld) {
            warn!(tld = %tld, "No nameserver addresses found");
        }
    }

    println!("{}", serde_json::to_string_pretty(&found.to_bootstrap())?);
    Ok(())
}

async fn run_bootstrap(
    output: &Path,
    root_zone: Option<&Path>,
    psl: Option<&Path>,
    skip_psl: bool,
    config: NameserverConfig,
) -> CliResult {
    let client = create_http_client(DOWNLOAD_TIMEOUT)?;

    let zone_text = match root_zone {
        Some(path) => fs::read_to_string(path)?,
        None => fetch_root_zone(&client).await?,
    };
    let mut directory = RootZone::parse(&zone_text)?.to_directory(config.include_ipv6);
    info!(tlds = directory.len(), "Loaded root zone");

    if !skip_psl {
        let psl_text = match psl {
            Some(path) => fs::read_to_string(path)?,
            None => fetch_public_suffix_list(&client).await?,
        };
        let suffixes = parse_public_suffix_list(&psl_text);
        let missing = missing_from(&suffixes, &directory);
        info!(suffixes = suffixes.len(), missing = missing.len(), "Resolving public suffixes");

        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());
        let engine = NameserverDiscovery::with_config(directory.clone(), config);
        let found = engine.generate_with_cancel(&missing, &cancel).await?;
        info!(resolved = found.len(), unresolved = missing.len().saturating_sub(found.len()), "Public suffixes resolved");
        directory.merge(found);
    }

    write_directory(output, &directory)?;
    eprintln!("Wrote {} TLDs to {}", directory.len(), output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let config: Config = toml::from_str(&get_default_config_toml()).unwrap();
        assert_eq!(config.discovery.chunk_size, 20);
        assert_eq!(config.discovery.timeout_secs, 2.0);
        assert!(config.discovery.probe_deadline_secs.is_none());
        assert!(config.discovery.max_in_flight.is_none());
        assert_eq!(config.nameservers.concurrency, 64);
        assert!(config.tlds.never.is_empty());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[discovery]\nchunk_size = 5\n").unwrap();
        assert_eq!(config.discovery.chunk_size, 5);
        assert_eq!(config.discovery.timeout_secs, 2.0);
        assert_eq!(config.nameservers.max_referrals, 3);
    }

    #[test]
    fn never_list_removes_tlds() {
        let directory = Directory::from_bootstrap(vec![
            ("com", vec!["192.0.2.1"]),
            ("xxx", vec!["192.0.2.2"]),
        ])
        .unwrap();
        let config = Config {
            tlds: TldConfig {
                never: vec!["XXX.".to_string()],
            },
            ..Config::default()
        };

        let directory = apply_config_to_directory(directory, &config);
        assert_eq!(directory.tlds().collect::<Vec<_>>(), vec!["com"]);
    }

    #[test]
    fn rejects_non_positive_durations() {
        assert!(seconds(0.0, "timeout").is_err());
        assert!(seconds(-1.0, "timeout").is_err());
        assert_eq!(seconds(1.5, "timeout").unwrap(), Duration::from_millis(1500));
        assert!(parse_seconds("0").is_err());
        assert!(parse_seconds("abc").is_err());
    }
}
