use std::{
    collections::HashSet,
    sync::LazyLock,
    time::Instant,
};

use eyre::bail;
use futures_util::StreamExt;
use regex::Regex;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::{MAX_EXTRACTED_IMAGES, MAX_PAGE_BYTES, UI_CHROME_FILENAME_MARKERS};

use super::{marketplace, ScrapeContext};

// this is a plain text scan, so it also finds urls inside scripts and json blobs
static IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>()\\/]+/[^\s"'<>()\\]*?\.(?i:jpe?g|png|webp)\b"#)
        .expect("image url pattern is valid")
});

/// Download the product page and pull candidate image urls out of it.
#[instrument(skip_all, fields(url = %product_url))]
pub async fn extract_images(ctx: &ScrapeContext, product_url: &Url) -> eyre::Result<Vec<String>> {
    let body = download_page(ctx, product_url).await?;
    let images = image_urls_from_html(&body);
    debug!("found {} candidate images", images.len());
    Ok(images)
}

/// Fetch the page as text. Error statuses aren't treated as failures, their
/// body gets scanned like any other.
pub async fn download_page(ctx: &ScrapeContext, url: &Url) -> eyre::Result<String> {
    if let Err(e) = ctx.egress().check(url) {
        bail!("refusing to fetch {url}: {e}");
    }

    let request_start = Instant::now();
    let res = ctx.http.get(url.clone()).send().await?;
    let request_duration = request_start.elapsed();
    debug!("page request took {request_duration:?}");

    if !res.status().is_success() {
        warn!("page responded with {}, scanning it anyway", res.status());
    }

    let mut body_bytes = Vec::new();
    let mut body_bytes_stream = res.bytes_stream();
    while let Some(chunk) = body_bytes_stream.next().await {
        body_bytes.extend_from_slice(&chunk?);
        // if it's more than 10mb then just use what we have so far
        if body_bytes.len() > MAX_PAGE_BYTES {
            warn!("too much data sent for page, only scanning the first {MAX_PAGE_BYTES} bytes");
            body_bytes.truncate(MAX_PAGE_BYTES);
            break;
        }
    }
    Ok(String::from_utf8_lossy(&body_bytes).into_owned())
}

/// Find image urls in the html, expanding cdn images into their base and
/// resized forms and skipping things that look like ui decoration.
pub fn image_urls_from_html(body: &str) -> Vec<String> {
    // used for deduplicating while keeping the order we found them in
    let mut seen = HashSet::new();
    let mut images = Vec::new();
    let mut push = |url: String| {
        if seen.insert(url.clone()) {
            images.push(url);
        }
    };

    for m in IMAGE_URL.find_iter(body) {
        let url = m.as_str();
        if marketplace::is_cdn_url(url) {
            for variant in marketplace::extraction_variants(url) {
                push(variant);
            }
        } else if !is_ui_chrome(url) {
            push(url.to_owned());
        } else {
            trace!("skipping ui image {url}");
        }
    }

    images.truncate(MAX_EXTRACTED_IMAGES);
    images
}

/// Sprites, icons, logos and so on. Only the filename is checked.
fn is_ui_chrome(url: &str) -> bool {
    let filename = url.rsplit('/').next().unwrap_or(url).to_ascii_lowercase();
    UI_CHROME_FILENAME_MARKERS
        .iter()
        .any(|marker| filename.contains(marker))
}
