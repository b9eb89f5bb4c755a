//! The two request handlers. They take the method and raw body of a request
//! and produce the status and json to send back, so they don't care what's
//! serving them.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::scrape::{image, page, ScrapeContext};

#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: impl Serialize) -> Self {
        Self {
            status: 200,
            // our response types are plain structs of strings, this can't fail
            body: serde_json::to_value(body).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Not found")]
    NotFound,
    #[error("{error}: {details}")]
    Upstream {
        error: &'static str,
        details: String,
    },
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::InvalidInput(_) => 400,
            ApiError::MethodNotAllowed => 405,
            ApiError::NotFound => 404,
            ApiError::Upstream { .. } => 500,
        }
    }

    fn upstream(error: &'static str, report: eyre::Report) -> Self {
        ApiError::Upstream {
            error,
            // include the causes, "error sending request" alone isn't very useful
            details: format!("{report:#}"),
        }
    }
}

impl From<ApiError> for ApiResponse {
    fn from(e: ApiError) -> Self {
        let body = match &e {
            ApiError::InvalidInput(message) => json!({ "error": message }),
            ApiError::MethodNotAllowed => json!({ "error": "Method not allowed" }),
            ApiError::NotFound => json!({ "error": "Not found" }),
            ApiError::Upstream { error, details } => json!({ "error": error, "details": details }),
        };
        ApiResponse {
            status: e.status(),
            body,
        }
    }
}

pub const PRODUCT_URL_REQUIRED: &str = "productUrl is required";
pub const PRODUCT_URL_NOT_ALLOWED: &str = "productUrl is not allowed";
pub const URLS_REQUIRED: &str = "urls must be a non-empty array";
pub const EXTRACT_FAILED: &str = "failed to extract images";
pub const RESOLVE_FAILED: &str = "failed to resolve images";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractImagesRequest {
    pub product_url: String,
}

#[derive(Debug, Serialize)]
pub struct ExtractImagesResponse {
    pub images: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveImagesRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolveImagesResponse {
    pub valid: Vec<String>,
}

#[instrument(skip_all)]
pub async fn handle_extract_images(ctx: &ScrapeContext, method: &str, body: &[u8]) -> ApiResponse {
    match extract_images(ctx, method, body).await {
        Ok(res) => ApiResponse::ok(res),
        Err(e) => {
            log_api_error(&e);
            e.into()
        }
    }
}

#[instrument(skip_all)]
pub async fn handle_resolve_images(ctx: &ScrapeContext, method: &str, body: &[u8]) -> ApiResponse {
    match resolve_images(ctx, method, body).await {
        Ok(res) => ApiResponse::ok(res),
        Err(e) => {
            log_api_error(&e);
            e.into()
        }
    }
}

async fn extract_images(
    ctx: &ScrapeContext,
    method: &str,
    body: &[u8],
) -> Result<ExtractImagesResponse, ApiError> {
    require_post(method)?;
    let ExtractImagesRequest { product_url } =
        parse_json_object(body).ok_or(ApiError::InvalidInput(PRODUCT_URL_REQUIRED))?;
    let product_url = product_url.trim();
    if product_url.is_empty() {
        return Err(ApiError::InvalidInput(PRODUCT_URL_REQUIRED));
    }

    // a url we can't even parse fails the same way a fetch to it would
    let product_url = Url::parse(product_url)
        .map_err(|e| ApiError::upstream(EXTRACT_FAILED, eyre::eyre!("invalid url: {e}")))?;
    if let Err(e) = ctx.egress().check(&product_url) {
        warn!("refusing product url {product_url}: {e}");
        return Err(ApiError::InvalidInput(PRODUCT_URL_NOT_ALLOWED));
    }

    let images = page::extract_images(ctx, &product_url)
        .await
        .map_err(|e| ApiError::upstream(EXTRACT_FAILED, e))?;
    info!("extracted {} images from {product_url}", images.len());
    Ok(ExtractImagesResponse { images })
}

async fn resolve_images(
    ctx: &ScrapeContext,
    method: &str,
    body: &[u8],
) -> Result<ResolveImagesResponse, ApiError> {
    require_post(method)?;
    let ResolveImagesRequest { urls } =
        parse_json_object(body).ok_or(ApiError::InvalidInput(URLS_REQUIRED))?;
    if urls.is_empty() {
        return Err(ApiError::InvalidInput(URLS_REQUIRED));
    }

    let input_count = urls.len();
    // probe failures are part of resolving and never fail the request, only
    // the resolver itself falling over does
    let task_ctx = ctx.clone();
    let valid = tokio::spawn(async move { image::resolve_images(&task_ctx, urls).await })
        .await
        .map_err(|e| ApiError::upstream(RESOLVE_FAILED, eyre::eyre!("resolver task failed: {e}")))?;
    info!("resolved {}/{input_count} images", valid.len());
    Ok(ResolveImagesResponse { valid })
}

/// Request bodies have to be json objects. serde would also fill a struct
/// from an array of its fields, so that's checked first.
fn parse_json_object<T: DeserializeOwned>(body: &[u8]) -> Option<T> {
    match serde_json::from_slice(body).ok()? {
        value @ Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    }
}

fn require_post(method: &str) -> Result<(), ApiError> {
    if method == "POST" {
        Ok(())
    } else {
        Err(ApiError::MethodNotAllowed)
    }
}

fn log_api_error(e: &ApiError) {
    match e {
        ApiError::Upstream { .. } => error!("{e}"),
        _ => warn!("{e}"),
    }
}
