pub mod api;
pub mod config;
pub mod scrape;
pub mod server;

use std::net::{Ipv4Addr, Ipv6Addr};

use config::Config;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{prelude::*, EnvFilter};
use url::{Host, Url};

/// Some origins (including the marketplace itself) refuse anything that
/// doesn't look like a browser.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0 Safari/537.36";
/// How many candidate urls the extractor returns at most.
pub const MAX_EXTRACTED_IMAGES: usize = 20;
/// Product pages bigger than this only get their beginning scanned.
pub const MAX_PAGE_BYTES: usize = 10 * 1024 * 1024;
// filename fragments that mean an image is part of the site's ui and not a
// product photo. compared case-insensitively.
pub const UI_CHROME_FILENAME_MARKERS: &[&str] =
    &["sprite", "icon", "logo", "transparent", "placeholder"];

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // logging isn't set up yet since the log file comes from the config
            eprintln!("invalid configuration: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("failed to set up logging: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> eyre::Result<()> {
    info!(
        "request timeout {:?}, probe concurrency {}",
        config.request_timeout, config.probe_concurrency
    );
    match &config.allowed_hosts {
        Some(hosts) => info!("outbound requests limited to {}", hosts.join(", ")),
        None => info!("outbound requests allowed to any public host"),
    }
    if config.allow_private_hosts {
        info!("private and loopback hosts are allowed, don't do this in production");
    }

    let ctx = scrape::ScrapeContext::new(&config)?;
    let listener = server::bind(config.bind).await?;
    server::serve(listener, ctx).await
}

fn init_tracing(config: &Config) -> eyre::Result<()> {
    let file_layer = match &config.log_file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::fs::File::create(path)?)
                .with_ansi(false)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive("reviewpix=trace".parse()?)
                        .from_env_lossy(),
                ),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy()
                    .add_directive("hyper=warn".parse()?)
                    .add_directive("reqwest=warn".parse()?),
            ),
        )
        .try_init()?;
    Ok(())
}

pub fn check_hosts_list_contains_url(hosts_list: &[&str], url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(page_domain)) => hosts_list
            .iter()
            .any(|&domain| page_domain == domain || page_domain.ends_with(&format!(".{domain}"))),
        // ip literals have no subdomains, they only match themselves
        Some(Host::Ipv4(ip)) => hosts_list.iter().any(|host| host.parse::<Ipv4Addr>().ok() == Some(ip)),
        Some(Host::Ipv6(ip)) => hosts_list.iter().any(|host| {
            host.trim_start_matches('[').trim_end_matches(']').parse::<Ipv6Addr>().ok() == Some(ip)
        }),
        None => false,
    }
}
