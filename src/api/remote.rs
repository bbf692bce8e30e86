//! Purpose: HTTP client for the portload gateway (JSON envelopes + multipart upload).
//! Exports: `RemoteClient`.
//! Role: Mirrors `PortStore` operations and the bulk upload route over HTTP.
//! Invariants: Error envelopes `{"error":{"kind",..}}` map back to `ErrorKind`.
//! Invariants: Uploads stream the file from disk; the body is never buffered whole.
#![allow(clippy::result_large_err)]

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use getrandom::fill as fill_random;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::UploadOutcome;
use crate::core::error::{Error, ErrorKind, map_io_error_kind};
use crate::core::port::{Port, PortId, PortPatch};

type ApiResult<T> = Result<T, Error>;

#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<RemoteClientInner>,
}

struct RemoteClientInner {
    base_url: Url,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct PortEnvelope {
    port: Port,
}

#[derive(Deserialize)]
struct PortsEnvelope {
    ports: Vec<Port>,
}

#[derive(Deserialize)]
struct UploadEnvelope {
    batches: u64,
    ports: u64,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    path: Option<String>,
    key: Option<String>,
    offset: Option<u64>,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new().build();
        Ok(Self {
            inner: Arc::new(RemoteClientInner { base_url, agent }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn list_ports(&self) -> ApiResult<Vec<Port>> {
        let url = build_url(&self.inner.base_url, &["ports"])?;
        let envelope: PortsEnvelope = self.request_json::<(), _>("GET", &url, &())?;
        Ok(envelope.ports)
    }

    pub fn fetch_port(&self, id: &PortId) -> ApiResult<Port> {
        let url = port_url(&self.inner.base_url, id)?;
        let envelope: PortEnvelope = self.request_json::<(), _>("GET", &url, &())?;
        Ok(envelope.port)
    }

    pub fn create_port(&self, port: &Port) -> ApiResult<Port> {
        let url = build_url(&self.inner.base_url, &["ports"])?;
        let envelope: PortEnvelope = self.request_json("POST", &url, port)?;
        Ok(envelope.port)
    }

    pub fn update_port(&self, id: &PortId, patch: &PortPatch) -> ApiResult<Port> {
        let url = port_url(&self.inner.base_url, id)?;
        let envelope: PortEnvelope = self.request_json("PUT", &url, patch)?;
        Ok(envelope.port)
    }

    pub fn delete_port(&self, id: &PortId) -> ApiResult<()> {
        let url = port_url(&self.inner.base_url, id)?;
        let _value: serde_json::Value = self.request_json::<(), _>("DELETE", &url, &())?;
        Ok(())
    }

    /// Streams the document at `path` to the upload route as multipart field `file`.
    pub fn upload_ports(&self, path: impl AsRef<Path>) -> ApiResult<UploadOutcome> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to open upload file")
                .with_path(path)
                .with_source(err)
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ports.json".to_string());
        let boundary = multipart_boundary()?;
        let body = multipart_body(&boundary, &file_name, file);

        let url = build_url(&self.inner.base_url, &["upload-ports"])?;
        let response = self
            .inner
            .agent
            .request("POST", url.as_str())
            .set("Accept", "application/json")
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send(body);
        let envelope: UploadEnvelope = handle_response(response)?;
        Ok(UploadOutcome {
            batches: envelope.batches,
            ports: envelope.ports,
        })
    }

    fn request_json<T, R>(&self, method: &str, url: &Url, body: &T) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = self
            .inner
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        let response = if method == "GET" || method == "DELETE" {
            request.call()
        } else {
            let payload = serde_json::to_string(body).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode request json")
                    .with_source(err)
            })?;
            request
                .set("Content-Type", "application/json")
                .send_string(&payload)
        };
        handle_response(response)
    }
}

fn handle_response<R>(response: Result<ureq::Response, ureq::Error>) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    match response {
        Ok(resp) => read_json_response(resp),
        Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
        Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
            .with_message("request failed")
            .with_source(err)),
    }
}

/// Random so an uploaded document cannot contain the delimiter by accident.
fn multipart_boundary() -> ApiResult<String> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate multipart boundary: {err}"))
    })?;
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    Ok(format!("portload-{hex}"))
}

fn multipart_body<R: Read>(boundary: &str, file_name: &str, file: R) -> impl Read {
    let file_name = file_name.replace('"', "_");
    let head = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/json\r\n\r\n"
    );
    let tail = format!("\r\n--{boundary}--\r\n");
    Cursor::new(head.into_bytes())
        .chain(file)
        .chain(Cursor::new(tail.into_bytes()))
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid gateway base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("gateway base url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("gateway base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("gateway base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn port_url(base_url: &Url, id: &PortId) -> ApiResult<Url> {
    let segment = id.to_string();
    build_url(base_url, &["ports", &segment])
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("gateway error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let kind = parse_error_kind(&remote.kind);
    let mut err = Error::new(kind);
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(path) = remote.path {
        err = err.with_path(path);
    }
    if let Some(key) = remote.key {
        err = err.with_key(key);
    }
    if let Some(offset) = remote.offset {
        err = err.with_offset(offset);
    }
    err
}

fn parse_error_kind(kind: &str) -> ErrorKind {
    match kind {
        "Internal" => ErrorKind::Internal,
        "Usage" => ErrorKind::Usage,
        "NotFound" => ErrorKind::NotFound,
        "AlreadyExists" => ErrorKind::AlreadyExists,
        "Permission" => ErrorKind::Permission,
        "Io" => ErrorKind::Io,
        "Storage" => ErrorKind::Storage,
        "Invalid" => ErrorKind::Invalid,
        "ReadFailure" => ErrorKind::ReadFailure,
        "MalformedTopLevel" => ErrorKind::MalformedTopLevel,
        "NonStringKey" => ErrorKind::NonStringKey,
        "ValueDecodeFailure" => ErrorKind::ValueDecodeFailure,
        _ => ErrorKind::Internal,
    }
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 | 422 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_url, error_kind_from_status, multipart_body, multipart_boundary, normalize_base_url,
        parse_error_kind, port_url,
    };
    use crate::core::error::ErrorKind;
    use crate::core::port::PortId;
    use std::io::Read;

    #[test]
    fn normalize_base_url_strips_path() {
        let url = normalize_base_url("http://localhost:8080".to_string()).expect("url");
        assert_eq!(url.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn normalize_base_url_rejects_paths_and_schemes() {
        let err = normalize_base_url("http://localhost:8080/api".to_string()).expect_err("path");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = normalize_base_url("ftp://localhost".to_string()).expect_err("scheme");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn port_urls_escape_slugs() {
        let base = normalize_base_url("http://127.0.0.1:9000".to_string()).expect("url");
        let url = port_url(&base, &PortId::Slug("A B/C".into())).expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/ports/A%20B%2FC");
        let url = port_url(&base, &PortId::Id(7)).expect("url");
        assert_eq!(url.path(), "/ports/7");
        let url = build_url(&base, &["upload-ports"]).expect("url");
        assert_eq!(url.path(), "/upload-ports");
    }

    #[test]
    fn multipart_boundaries_are_random() {
        let first = multipart_boundary().expect("boundary");
        let second = multipart_boundary().expect("boundary");
        assert_ne!(first, second);
        assert!(first.starts_with("portload-"));
        assert_eq!(first.len(), "portload-".len() + 32);
        assert!(first["portload-".len()..].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn multipart_body_wraps_file_field() {
        let mut body = String::new();
        multipart_body("XYZ", "ports.json", &b"{}"[..])
            .read_to_string(&mut body)
            .expect("read");
        assert!(body.starts_with("--XYZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"ports.json\"\r\n"));
        assert!(body.ends_with("\r\n\r\n{}\r\n--XYZ--\r\n"));
    }

    #[test]
    fn parse_error_kind_maps_known_values() {
        assert_eq!(parse_error_kind("NotFound"), ErrorKind::NotFound);
        assert_eq!(parse_error_kind("AlreadyExists"), ErrorKind::AlreadyExists);
        assert_eq!(parse_error_kind("ValueDecodeFailure"), ErrorKind::ValueDecodeFailure);
        assert_eq!(parse_error_kind("Mystery"), ErrorKind::Internal);
    }

    #[test]
    fn status_fallback_kinds() {
        assert_eq!(error_kind_from_status(413), ErrorKind::Usage);
        assert_eq!(error_kind_from_status(404), ErrorKind::NotFound);
        assert_eq!(error_kind_from_status(503), ErrorKind::Internal);
    }
}
