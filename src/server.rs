//! Minimal HTTP/1.1 listener for the handlers. One request per connection,
//! always answered with json and `Connection: close`.

use std::{net::SocketAddr, time::Duration};

use eyre::{bail, eyre};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    api::{self, ApiError, ApiResponse},
    scrape::ScrapeContext,
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const MAX_HEADER_LINES: usize = 100;
const MAX_LINE_BYTES: usize = 8 * 1024;
/// How long a client gets to send us the whole request.
const READ_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

pub async fn bind(addr: SocketAddr) -> eyre::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections forever, handling each one in its own task.
pub async fn serve(listener: TcpListener, ctx: ScrapeContext) -> eyre::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&ctx, stream, peer).await {
                debug!("connection from {peer} ended with an error: {e}");
            }
        });
    }
}

#[instrument(skip(ctx, stream))]
async fn handle_connection(
    ctx: &ScrapeContext,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> eyre::Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    let response = match tokio::time::timeout(READ_REQUEST_TIMEOUT, read_request(&mut reader)).await
    {
        Ok(Ok(request)) => {
            debug!("{} {}", request.method, request.path);
            route(ctx, &request).await
        }
        Ok(Err(e)) => {
            debug!("bad request: {e}");
            bad_request()
        }
        Err(_) => {
            debug!("timed out reading request");
            bad_request()
        }
    };

    write_response(&mut write_half, &response).await?;
    Ok(())
}

pub async fn route(ctx: &ScrapeContext, request: &Request) -> ApiResponse {
    // serverless platforms don't care about trailing slashes or query strings
    // either
    let path = request.path.split(['?', '#']).next().unwrap_or_default();
    let path = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };

    match path {
        "/api/extract-images" => {
            api::handle_extract_images(ctx, &request.method, &request.body).await
        }
        "/api/resolve-images" => {
            api::handle_resolve_images(ctx, &request.method, &request.body).await
        }
        "/healthz" if request.method == "GET" => {
            ApiResponse::ok(json!({ "status": "ok" }))
        }
        "/healthz" => ApiError::MethodNotAllowed.into(),
        _ => ApiError::NotFound.into(),
    }
}

fn bad_request() -> ApiResponse {
    ApiResponse {
        status: 400,
        body: json!({ "error": "Bad request" }),
    }
}

pub async fn read_request<R>(reader: &mut BufReader<R>) -> eyre::Result<Request>
where
    R: AsyncRead + Unpin,
{
    let request_line = read_line(reader).await?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed request line: {request_line:?}");
    };
    if !version.starts_with("HTTP/1.") {
        bail!("unsupported http version: {version}");
    }
    let (method, path) = (method.to_owned(), path.to_owned());

    let mut content_length = 0_usize;
    let mut header_count = 0;
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        header_count += 1;
        if header_count > MAX_HEADER_LINES {
            bail!("too many headers");
        }
        let Some((name, value)) = line.split_once(':') else {
            bail!("malformed header: {line:?}");
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| eyre!("invalid content-length: {value:?}"))?;
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && !value.eq_ignore_ascii_case("identity")
        {
            // nobody sends chunked json to these endpoints
            bail!("unsupported transfer-encoding: {value}");
        }
    }

    if content_length > MAX_REQUEST_BODY_BYTES {
        bail!("request body too large ({content_length} bytes)");
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).await?;

    Ok(Request { method, path, body })
}

/// Read one CRLF (or LF) terminated line, without the line ending.
async fn read_line<R>(reader: &mut BufReader<R>) -> eyre::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        bail!("connection closed before the request was complete");
    }
    if !line.ends_with(b"\n") {
        bail!("line too long or truncated");
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(String::from_utf8(line)?)
}

pub async fn write_response<W>(writer: &mut W, response: &ApiResponse) -> eyre::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(&response.body)?;
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
        status = response.status,
        reason = reason_phrase(response.status),
        len = body.len(),
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "",
    }
}
