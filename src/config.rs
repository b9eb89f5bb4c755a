//! Process configuration, read once from the environment at startup.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use eyre::{bail, eyre, WrapErr};

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_PROBE_CONCURRENCY: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub bind: SocketAddr,
    /// Applies to every outbound request separately (the page fetch and each
    /// probe).
    pub request_timeout: Duration,
    /// How many input urls the resolver works on at the same time.
    pub probe_concurrency: usize,
    /// If set, outbound requests may only go to these hosts (and their
    /// subdomains).
    pub allowed_hosts: Option<Vec<String>>,
    /// Whether loopback/private addresses may be requested. Off unless you're
    /// testing against something local.
    pub allow_private_hosts: bool,
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
            allowed_hosts: None,
            allow_private_hosts: false,
            log_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup. Unset or empty
    /// variables fall back to the defaults, anything else has to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let bind = parse_var(&get, "REVIEWPIX_BIND", DEFAULT_BIND.parse::<SocketAddr>()?)?;
        let request_timeout_secs = parse_var(
            &get,
            "REVIEWPIX_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        if request_timeout_secs == 0 {
            bail!("REVIEWPIX_REQUEST_TIMEOUT_SECS must be at least 1");
        }
        let probe_concurrency = parse_var(
            &get,
            "REVIEWPIX_PROBE_CONCURRENCY",
            DEFAULT_PROBE_CONCURRENCY,
        )?;
        if probe_concurrency == 0 {
            bail!("REVIEWPIX_PROBE_CONCURRENCY must be at least 1");
        }

        let allowed_hosts = get("REVIEWPIX_ALLOWED_HOSTS").map(|hosts| {
            hosts
                .split(',')
                .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect::<Vec<_>>()
        });
        if matches!(&allowed_hosts, Some(hosts) if hosts.is_empty()) {
            bail!("REVIEWPIX_ALLOWED_HOSTS is set but doesn't contain any hosts");
        }

        let allow_private_hosts = match get("REVIEWPIX_ALLOW_PRIVATE_HOSTS") {
            None => false,
            Some(v) => parse_bool(&v)
                .ok_or_else(|| eyre!("REVIEWPIX_ALLOW_PRIVATE_HOSTS must be a boolean, got {v:?}"))?,
        };

        Ok(Self {
            bind,
            request_timeout: Duration::from_secs(request_timeout_secs),
            probe_concurrency,
            allowed_hosts,
            allow_private_hosts,
            log_file: get("REVIEWPIX_LOG_FILE"),
        })
    }
}

fn parse_var<T>(get: impl Fn(&str) -> Option<String>, key: &str, default: T) -> eyre::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(v) => v
            .parse::<T>()
            .wrap_err_with(|| format!("invalid value for {key}: {v:?}")),
        None => Ok(default),
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
