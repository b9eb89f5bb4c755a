//! Decides which urls we're willing to make requests to. Every url we fetch
//! comes from the caller, so without this anyone could make us request things
//! on our own network.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::check_hosts_list_contains_url;

#[derive(Clone, Debug, Default)]
pub struct EgressPolicy {
    allowed_hosts: Option<Vec<String>>,
    allow_private_hosts: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EgressDenied {
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("url has no host")]
    MissingHost,
    #[error("host {0} is a private or loopback address")]
    PrivateHost(String),
    #[error("host {0} is not in the allowed hosts list")]
    HostNotAllowed(String),
}

impl EgressPolicy {
    pub fn new(allowed_hosts: Option<Vec<String>>, allow_private_hosts: bool) -> Self {
        Self {
            allowed_hosts,
            allow_private_hosts,
        }
    }

    pub fn check(&self, url: &Url) -> Result<(), EgressDenied> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EgressDenied::UnsupportedScheme(url.scheme().to_owned()));
        }
        let host = url.host().ok_or(EgressDenied::MissingHost)?;

        if !self.allow_private_hosts && is_private_host(&host) {
            return Err(EgressDenied::PrivateHost(host.to_string()));
        }

        if let Some(allowed_hosts) = &self.allowed_hosts {
            let allowed_hosts = allowed_hosts.iter().map(String::as_str).collect::<Vec<_>>();
            if !check_hosts_list_contains_url(&allowed_hosts, url) {
                return Err(EgressDenied::HostNotAllowed(host.to_string()));
            }
        }

        Ok(())
    }
}

fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Host::Ipv4(ip) => is_private_ipv4(ip),
        Host::Ipv6(ip) => is_private_ipv6(ip),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 0.0.0.0/8, "this network"
        || a == 0
        // 100.64.0.0/10, carrier-grade nat
        || (a == 100 && (64..128).contains(&b))
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    let segments = ip.segments();
    // 64:ff9b::/96, nat64 with the ipv4 address in the last 32 bits
    if segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        let [.., a, b, c, d] = ip.octets();
        return is_private_ipv4(&Ipv4Addr::new(a, b, c, d));
    }
    let first_segment = segments[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7, unique local
        || (first_segment & 0xfe00) == 0xfc00
        // fe80::/10, link local
        || (first_segment & 0xffc0) == 0xfe80
}
