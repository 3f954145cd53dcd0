use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use serde::Deserialize;

use crate::spoof::{RuleSet, SpoofRule};

const CONFIG_FILE_NAME: &str = ".spoofproxy.yml";

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Local development proxy with host spoofing",
    long_about = "spoofproxy is a forward proxy for local development that rewrites \
request destinations matching configured host patterns, and tunnels HTTPS \
traffic transparently via CONNECT.\n\nSpoofing rules are read from a YAML \
config file (first of ./.spoofproxy.yml, ~/.spoofproxy.yml, or --config):\n\n\
  bind: localhost\n  port: 8080\n  hosts:\n    - ^test\\.com:80$: 127.0.0.1:9000\n"
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Interface to bind the listener to
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Config file path (default: first of ./.spoofproxy.yml, ~/.spoofproxy.yml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print each request and spoof decision to the log
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,
}

/// On-disk YAML configuration. `hosts` is an ordered list of single-pair
/// `pattern: replacement` maps so rule priority follows file order.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    port: Option<u16>,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    hosts: Vec<BTreeMap<String, String>>,
}

/// Runtime proxy configuration, immutable for the process lifetime and
/// shared by all request-handling tasks.
#[derive(Debug)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub debug: bool,
    pub rules: RuleSet,
}

impl ProxyConfig {
    /// Build the runtime configuration from CLI arguments and the first
    /// readable config file. Flags given on the command line override file
    /// values.
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let candidates = config_candidates(args.config.as_ref());
        let file = load_file_config(&candidates)?;

        let bind = args
            .bind
            .or(file.bind)
            .unwrap_or_else(|| "localhost".to_string());
        let port = args.port.or(file.port).unwrap_or(8080);
        let debug = args.debug || file.debug;

        let mut rules = Vec::new();
        for entry in &file.hosts {
            for (pattern, replacement) in entry {
                let rule = SpoofRule::new(pattern, replacement.clone())
                    .wrap_err_with(|| format!("invalid host pattern '{pattern}'"))?;
                rules.push(rule);
            }
        }

        Ok(Self {
            listen_addr: format!("{bind}:{port}"),
            debug,
            rules: RuleSet::new(rules),
        })
    }
}

fn config_candidates(explicit: Option<&PathBuf>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.clone()];
    }
    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(CONFIG_FILE_NAME));
    }
    candidates
}

fn load_file_config(candidates: &[PathBuf]) -> color_eyre::Result<FileConfig> {
    for path in candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                return serde_yaml::from_str(&contents)
                    .wrap_err_with(|| format!("invalid config file {}", path.display()));
            }
            Err(_) => continue,
        }
    }
    Err(eyre!(
        "no readable config file found (tried: {})",
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    ))
}
