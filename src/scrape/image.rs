use std::time::Instant;

use futures_util::{stream, StreamExt};
use reqwest::{header, Method, Response, StatusCode};
use tracing::{debug, instrument, trace};
use url::Url;

use super::{marketplace, ScrapeContext};

/// What happened when we tried one variant url.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// The url is a live image.
    Accepted,
    /// The server answered but it's not an image we can use.
    Rejected { reason: String },
    /// We couldn't get an answer at all.
    Failed(eyre::Report),
}

/// Resolve every input url to a variant that actually serves an image. Urls
/// with no working variant are left out, the rest keep their input order.
pub async fn resolve_images(ctx: &ScrapeContext, urls: Vec<String>) -> Vec<String> {
    let resolve_start = Instant::now();
    let input_count = urls.len();

    // buffered keeps the output in input order even though the urls are
    // probed concurrently
    let resolved = stream::iter(urls)
        .map(|url| async move { resolve_image(ctx, &url).await })
        .buffered(ctx.probe_concurrency)
        .filter_map(|resolved| async move { resolved })
        .collect::<Vec<_>>()
        .await;

    debug!(
        "resolved {}/{input_count} images in {:?}",
        resolved.len(),
        resolve_start.elapsed()
    );
    resolved
}

/// Try the variants of `url` in priority order and return the first one that's
/// a live image.
#[instrument(skip(ctx))]
pub async fn resolve_image(ctx: &ScrapeContext, url: &str) -> Option<String> {
    first_accepted(marketplace::resolver_variants(url), |variant| async move {
        let outcome = probe(ctx, &variant).await;
        (variant, outcome)
    })
    .await
}

/// Run `attempt` on each candidate in order, stopping at the first accepted
/// one. Nothing after it is tried.
pub async fn first_accepted<F, Fut>(candidates: Vec<String>, attempt: F) -> Option<String>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = (String, ProbeOutcome)>,
{
    for candidate in candidates {
        match attempt(candidate).await {
            (candidate, ProbeOutcome::Accepted) => {
                trace!("{candidate} is a live image");
                return Some(candidate);
            }
            (candidate, ProbeOutcome::Rejected { reason }) => {
                trace!("{candidate} rejected: {reason}");
            }
            (candidate, ProbeOutcome::Failed(e)) => {
                trace!("{candidate} failed: {e}");
            }
        }
    }
    None
}

/// Check whether `url` serves an image. HEAD first, and GET if the server
/// doesn't like HEAD.
pub async fn probe(ctx: &ScrapeContext, url: &str) -> ProbeOutcome {
    let url = match Url::parse(url) {
        Ok(url) => url,
        Err(e) => {
            return ProbeOutcome::Rejected {
                reason: format!("invalid url: {e}"),
            }
        }
    };
    if let Err(e) = ctx.egress().check(&url) {
        return ProbeOutcome::Rejected {
            reason: e.to_string(),
        };
    }

    let res = match send_probe(ctx, Method::HEAD, &url).await {
        Ok(res) => res,
        Err(e) => return ProbeOutcome::Failed(e),
    };
    if matches!(
        res.status(),
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::FORBIDDEN
    ) {
        trace!("HEAD got {}, retrying with GET", res.status());
        // the body is never read, dropping the response closes it
        return match send_probe(ctx, Method::GET, &url).await {
            Ok(res) => check_image_response(&res),
            Err(e) => ProbeOutcome::Failed(e),
        };
    }
    check_image_response(&res)
}

async fn send_probe(ctx: &ScrapeContext, method: Method, url: &Url) -> eyre::Result<Response> {
    let request_start = Instant::now();
    let res = ctx.http.request(method.clone(), url.clone()).send().await?;
    trace!(
        "{method} {url} -> {} in {:?}",
        res.status(),
        request_start.elapsed()
    );
    Ok(res)
}

fn check_image_response(res: &Response) -> ProbeOutcome {
    if !res.status().is_success() {
        return ProbeOutcome::Rejected {
            reason: format!("status {}", res.status()),
        };
    }
    let content_type = res
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if !content_type.trim_start().to_ascii_lowercase().starts_with("image/") {
        return ProbeOutcome::Rejected {
            reason: format!("content-type was {content_type:?}"),
        };
    }
    ProbeOutcome::Accepted
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use httpmock::{prelude::*, Method::HEAD};

    use super::*;
    use crate::scrape::test_context;

    #[tokio::test]
    async fn test_original_url_is_tried_first() {
        let server = MockServer::start_async().await;
        let original = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/images/I/abc._AC_SL1500_.jpg");
                then.status(200).header("content-type", "image/jpeg");
            })
            .await;
        let base = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/images/I/abc.jpg");
                then.status(200).header("content-type", "image/jpeg");
            })
            .await;

        let ctx = test_context();
        let url = server.url("/images/I/abc._AC_SL1500_.jpg");
        assert_eq!(resolve_image(&ctx, &url).await, Some(url.clone()));
        original.assert_async().await;
        assert_eq!(base.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_the_next_variant_in_priority_order() {
        let server = MockServer::start_async().await;
        // the original and the bare url 404 (no mock), both of these work but
        // the 1500 one comes first
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/images/I/abc._SL1500_.jpg");
                then.status(200).header("content-type", "image/jpeg");
            })
            .await;
        let smaller = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/images/I/abc._SL500_.jpg");
                then.status(200).header("content-type", "image/jpeg");
            })
            .await;

        let ctx = test_context();
        let resolved = resolve_image(&ctx, &server.url("/images/I/abc._SX300_.jpg")).await;
        assert_eq!(resolved, Some(server.url("/images/I/abc._SL1500_.jpg")));
        assert_eq!(smaller.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_retries_with_get_when_head_is_refused() {
        for status in [403, 405] {
            let server = MockServer::start_async().await;
            let head = server
                .mock_async(|when, then| {
                    when.method(HEAD).path("/photo.png");
                    then.status(status);
                })
                .await;
            let get = server
                .mock_async(|when, then| {
                    when.method(GET).path("/photo.png");
                    then.status(200)
                        .header("content-type", "image/png")
                        .body("not really a png");
                })
                .await;

            let ctx = test_context();
            let url = server.url("/photo.png");
            assert_eq!(resolve_image(&ctx, &url).await, Some(url.clone()));
            head.assert_async().await;
            get.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_non_image_responses_are_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD);
                then.status(200).header("content-type", "text/html");
            })
            .await;

        let ctx = test_context();
        let outcome = probe(&ctx, &server.url("/photo.jpg")).await;
        assert!(matches!(outcome, ProbeOutcome::Rejected { .. }));
        assert_eq!(resolve_image(&ctx, &server.url("/photo.jpg")).await, None);
    }

    #[tokio::test]
    async fn test_other_errors_do_not_retry_with_get() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD);
                then.status(500);
            })
            .await;
        let get = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).header("content-type", "image/jpeg");
            })
            .await;

        let ctx = test_context();
        assert_eq!(resolve_image(&ctx, &server.url("/photo.jpg")).await, None);
        assert_eq!(get.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_unresolvable_urls_are_dropped_and_order_is_kept() {
        let server = MockServer::start_async().await;
        for path in ["/a.jpg", "/c.jpg"] {
            server
                .mock_async(|when, then| {
                    when.method(HEAD).path(path);
                    then.status(200).header("content-type", "image/jpeg");
                })
                .await;
        }

        let ctx = test_context();
        let urls = vec![
            server.url("/c.jpg"),
            server.url("/notfound.jpg"),
            server.url("/a.jpg"),
            // nothing listens here, so every variant fails to connect
            "http://127.0.0.1:9/b.jpg".to_owned(),
            "not a url".to_owned(),
        ];
        let resolved = resolve_images(&ctx, urls).await;
        assert_eq!(resolved, vec![server.url("/c.jpg"), server.url("/a.jpg")]);

        // same upstream, same answer
        let again = resolve_images(&ctx, vec![server.url("/c.jpg"), server.url("/a.jpg")]).await;
        assert_eq!(again, resolved);
    }

    #[tokio::test]
    async fn test_refused_hosts_are_never_requested() {
        let server = MockServer::start_async().await;
        let any = server
            .mock_async(|when, then| {
                when.any_request();
                then.status(200).header("content-type", "image/jpeg");
            })
            .await;

        let ctx = ScrapeContext::new(&crate::config::Config::default()).unwrap();
        assert_eq!(resolve_image(&ctx, &server.url("/a.jpg")).await, None);
        assert_eq!(any.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_first_accepted_stops_at_the_first_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let candidates = vec!["a".to_owned(), "b".to_owned(), "c".to_owned(), "d".to_owned()];
        let result = first_accepted(candidates, |candidate| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                let outcome = match candidate.as_str() {
                    "a" => ProbeOutcome::Failed(eyre::eyre!("connection reset")),
                    "b" => ProbeOutcome::Rejected {
                        reason: "status 404".to_owned(),
                    },
                    _ => ProbeOutcome::Accepted,
                };
                (candidate, outcome)
            }
        })
        .await;
        assert_eq!(result.as_deref(), Some("c"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
