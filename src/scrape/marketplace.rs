//! Amazon's image cdn encodes resizing and cropping in the filename, like
//! `https://m.media-amazon.com/images/I/81abc123._AC_SL1500_.jpg`. The same
//! image is available with any (or no) token, so we can rewrite the token to
//! get the size we want.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

pub const CDN_HOSTS: &[&str] = &[
    "m.media-amazon.com",
    "images-na.ssl-images-amazon.com",
    "images-eu.ssl-images-amazon.com",
    "images-fe.ssl-images-amazon.com",
    "images-amazon.com",
    "ecx.images-amazon.com",
];
/// Any subdomain of these is also treated as the image cdn.
pub const CDN_HOST_SUFFIXES: &[&str] = &["media-amazon.com", "ssl-images-amazon.com"];

/// Tokens inserted before the extension to make the extra sizes during
/// extraction.
pub const EXTRACTED_SIZE_TOKENS: &[&str] = &["._SL1000_", "._SL500_"];

/// Tokens tried by the resolver, best first. The empty token is the plain
/// full-size image.
pub const RESOLVER_SIZE_TOKENS: &[&str] = &[
    "",
    "._AC_SL1500_",
    "._SL1500_",
    "._AC_SL1000_",
    "._SL1000_",
    "._AC_SL500_",
    "._SL500_",
];

// the modifiers sit between the image id and the extension, starting and
// ending with an underscore. several can be chained in one segment, like
// `81abc._AC_SY300_SX300_QL70_FMwebp_.jpg`
static MODIFIER_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)\.(_[^./]*_)(\.[A-Za-z0-9]+)$").expect("modifier segment pattern is valid")
});

// a modifier segment is only dropped when it resizes or crops, anything else
// could be part of the image's name
static SIZE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        // size, optionally with auto-crop
        r"_(?:AC_)?(?:SL|SX|SY|SS|UL|UX|UY)\d+_",
        // crop
        r"|_CR,?\d+(?:,\d+){3}_",
        // region crop
        r"|_SR\d+,\d+_",
    ))
    .expect("size token pattern is valid")
});

static CDN_IMAGE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*/images/I/[^./]+)(?:\.[^/]*)?(\.[A-Za-z0-9]+)$")
        .expect("cdn image path pattern is valid")
});
static FILE_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)(\.[A-Za-z0-9]{2,5})$").expect("extension pattern is valid")
});

pub fn is_cdn_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    CDN_HOSTS.contains(&host.as_str())
        || CDN_HOST_SUFFIXES
            .iter()
            .any(|suffix| host.ends_with(&format!(".{suffix}")))
}

pub fn is_cdn_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(is_cdn_host))
        .unwrap_or_default()
}

/// Remove the size modifiers from the filename, giving the url of the
/// full-size image.
pub fn strip_size_tokens(url: &str) -> String {
    let (path, suffix) = split_query(url);
    let (dir, file) = split_filename(path);
    let mut file = file.to_owned();
    while let Some(stripped) = strip_modifier_segment(&file) {
        file = stripped;
    }
    format!("{dir}{file}{suffix}")
}

fn strip_modifier_segment(file: &str) -> Option<String> {
    let caps = MODIFIER_SEGMENT.captures(file)?;
    if !SIZE_TOKEN.is_match(&caps[2]) {
        return None;
    }
    Some(format!("{}{}", &caps[1], &caps[3]))
}

/// Insert a size token right before the file extension. Urls without an
/// extension get the token appended.
pub fn with_size_token(url: &str, token: &str) -> String {
    let (path, suffix) = split_query(url);
    let (dir, file) = split_filename(path);
    match file.rfind('.') {
        Some(dot) => format!("{dir}{}{token}{}{suffix}", &file[..dot], &file[dot..]),
        None => format!("{path}{token}{suffix}"),
    }
}

/// The base form and the extra sizes we return for a cdn image found in a
/// page.
pub fn extraction_variants(url: &str) -> Vec<String> {
    let base = strip_size_tokens(url);
    let mut variants = vec![base.clone()];
    for token in EXTRACTED_SIZE_TOKENS {
        variants.push(with_size_token(&base, token));
    }
    variants
}

/// A url split around the spot where a size token goes.
#[derive(Debug, PartialEq, Eq)]
pub struct ImageUrlParts {
    /// Everything before the size token.
    pub base: String,
    /// The extension, including the dot.
    pub ext: String,
    /// The query and fragment, kept as they were.
    pub suffix: String,
}

impl ImageUrlParts {
    pub fn with_token(&self, token: &str) -> String {
        format!("{}{token}{}{}", self.base, self.ext, self.suffix)
    }
}

/// Split a url into the part we can rebuild with a different size token and
/// its extension. Only the filename can hold the extension, urls without one
/// are treated as jpegs.
pub fn decompose(url: &str) -> ImageUrlParts {
    let (path, suffix) = split_query(url);
    let parts = |base: &str, ext: &str| ImageUrlParts {
        base: base.to_owned(),
        ext: ext.to_owned(),
        suffix: suffix.to_owned(),
    };

    if let Some(caps) = CDN_IMAGE_PATH.captures(path) {
        return parts(&caps[1], &caps[2]);
    }
    let (dir, file) = split_filename(path);
    if let Some(caps) = FILE_EXTENSION.captures(file) {
        return parts(&format!("{dir}{}", &caps[1]), &caps[2]);
    }
    if file.is_empty() && !path.ends_with('/') {
        // keep the token off the host
        return parts(&format!("{path}/"), ".jpg");
    }
    parts(path, ".jpg")
}

/// Every url the resolver will try for `url`, in the order it'll try them. The
/// url itself always comes first.
pub fn resolver_variants(url: &str) -> Vec<String> {
    let parts = decompose(url);
    let mut variants = vec![url.to_owned()];
    for token in RESOLVER_SIZE_TOKENS {
        let variant = parts.with_token(token);
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

fn split_query(url: &str) -> (&str, &str) {
    match url.find(['?', '#']) {
        Some(i) => url.split_at(i),
        None => (url, ""),
    }
}

/// Split a url without its query into everything up to the last `/` of the
/// path and the filename. A url with no path has an empty filename.
fn split_filename(url: &str) -> (&str, &str) {
    let path_start = match url.find("://") {
        Some(i) => url[i + 3..].find('/').map_or(url.len(), |j| i + 3 + j),
        None => 0,
    };
    let file_start = url[path_start..]
        .rfind('/')
        .map_or(path_start, |i| path_start + i + 1);
    url.split_at(file_start)
}
