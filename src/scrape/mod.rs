use std::{sync::Arc, time::Duration};

use reqwest::{header, redirect};

use crate::{config::Config, USER_AGENT};

pub mod egress;
pub mod image;
pub mod marketplace;
pub mod page;

use egress::EgressPolicy;

pub const MAX_REDIRECTS: usize = 10;

#[derive(Clone)]
pub struct ScrapeContext {
    http: reqwest::Client,
    egress: Arc<EgressPolicy>,
    probe_concurrency: usize,
}

impl ScrapeContext {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        let egress = Arc::new(EgressPolicy::new(
            config.allowed_hosts.clone(),
            config.allow_private_hosts,
        ));

        let redirect_egress = egress.clone();
        let redirect_policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if let Err(e) = redirect_egress.check(attempt.url()) {
                // don't let an allowed host bounce us somewhere we wouldn't go
                // directly
                attempt.error(e)
            } else {
                attempt.follow()
            }
        });

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,image/avif,image/webp,image/*,*/*;q=0.8",
            ),
        );
        default_headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static("en-US,en;q=0.9"),
        );

        let http = reqwest::ClientBuilder::new()
            // some sites refuse to talk to anything that doesn't look like a browser
            .user_agent(USER_AGENT)
            .default_headers(default_headers)
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(Duration::from_secs(10)))
            .redirect(redirect_policy)
            .build()?;

        Ok(Self {
            http,
            egress,
            probe_concurrency: config.probe_concurrency.max(1),
        })
    }

    pub fn egress(&self) -> &EgressPolicy {
        &self.egress
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> ScrapeContext {
    // mock servers listen on loopback
    let config = Config {
        allow_private_hosts: true,
        request_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    ScrapeContext::new(&config).unwrap()
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    #[tokio::test]
    async fn test_redirects_are_checked_against_the_policy() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/start");
                then.status(302).header("Location", "http://example.com/elsewhere");
            })
            .await;

        let ctx = ScrapeContext::new(&Config {
            allowed_hosts: Some(vec!["localhost".to_owned()]),
            allow_private_hosts: true,
            ..Config::default()
        })
        .unwrap();

        let err = ctx
            .http
            .get(format!("http://localhost:{}/start", server.port()))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_redirect(), "expected a redirect error, got {err}");
    }
}
