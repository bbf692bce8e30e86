//! Purpose: End-to-end tests for the HTTP gateway and `RemoteClient`.
//! Exports: None (integration test module).
//! Role: Validate port CRUD, bulk upload, and error propagation across TCP.
//! Invariants: Uses loopback-only server with a temp snapshot file.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use portload::api::{ErrorKind, Port, PortId, PortPatch, RemoteClient};
use serde_json::Value;
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

const PORTS: &str = r#"{
  "AEAJM": {"name": "Ajman", "city": "Ajman", "country": "United Arab Emirates",
            "coordinates": [55.5136433, 25.4052165], "timezone": "Asia/Dubai",
            "unlocs": ["AEAJM"], "code": "52000"},
  "AEAUH": {"name": "Abu Dhabi", "city": "Abu Dhabi", "country": "United Arab Emirates",
            "coordinates": [54.37, 24.47], "timezone": "Asia/Dubai",
            "unlocs": ["AEAUH"], "code": "52001"},
  "AEDXB": {"name": "Dubai", "city": "Dubai", "country": "United Arab Emirates",
            "coordinates": [55.27, 25.25], "timezone": "Asia/Dubai",
            "unlocs": ["AEDXB"], "code": "52005"}
}"#;

struct TestServer {
    child: Child,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(store: &Path) -> TestResult<Self> {
        Self::start_with_args(store, &[])
    }

    fn start_with_args(store: &Path, extra: &[&str]) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut child = Command::new(env!("CARGO_BIN_EXE_portload"))
                .arg("--store")
                .arg(store)
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .args(extra)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn client(&self) -> TestResult<RemoteClient> {
        Ok(RemoteClient::new(self.base_url.clone())?)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_document(dir: &Path, body: &str) -> TestResult<PathBuf> {
    let path = dir.join("upload.json");
    std::fs::write(&path, body)?;
    Ok(path)
}

fn slugs(ports: &[Port]) -> Vec<&str> {
    ports.iter().map(|port| port.slug.as_str()).collect()
}

#[test]
fn remote_create_fetch_update_delete() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&temp_dir.path().join("ports.json"))?;
    let client = server.client()?;

    let created = client.create_port(&Port {
        slug: "NLRTM".to_string(),
        name: "Rotterdam".to_string(),
        country: "Netherlands".to_string(),
        ..Port::default()
    })?;
    assert_eq!(created.id, 1);

    let by_slug = client.fetch_port(&PortId::parse("NLRTM")?)?;
    let by_id = client.fetch_port(&PortId::Id(created.id))?;
    assert_eq!(by_slug, created);
    assert_eq!(by_id, created);

    let updated = client.update_port(
        &PortId::parse("NLRTM")?,
        &PortPatch {
            city: Some("Rotterdam".to_string()),
            ..PortPatch::default()
        },
    )?;
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.city, "Rotterdam");
    assert_eq!(updated.name, "Rotterdam");

    client.delete_port(&PortId::Id(created.id))?;
    assert!(client.list_ports()?.is_empty());
    Ok(())
}

#[test]
fn remote_errors_keep_their_kind() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&temp_dir.path().join("ports.json"))?;
    let client = server.client()?;

    let missing = client
        .fetch_port(&PortId::parse("ZZZZZ")?)
        .expect_err("missing port");
    assert_eq!(missing.kind(), ErrorKind::NotFound);
    assert!(missing.hint().is_some());

    let port = Port {
        slug: "AEAJM".to_string(),
        ..Port::default()
    };
    client.create_port(&port)?;
    let dup = client.create_port(&port).expect_err("duplicate");
    assert_eq!(dup.kind(), ErrorKind::AlreadyExists);

    let empty = client
        .update_port(&PortId::parse("AEAJM")?, &PortPatch::default())
        .expect_err("empty patch");
    assert_eq!(empty.kind(), ErrorKind::Usage);

    let no_slug = client.create_port(&Port::default()).expect_err("empty slug");
    assert_eq!(no_slug.kind(), ErrorKind::Invalid);
    Ok(())
}

#[test]
fn remote_upload_streams_document() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let store = temp_dir.path().join("ports.json");
    let server = TestServer::start_with_args(&store, &["--batch-size", "2", "--chunk-size", "32"])?;
    let client = server.client()?;
    let document = write_document(temp_dir.path(), PORTS)?;

    let outcome = client.upload_ports(&document)?;
    assert_eq!(outcome.batches, 2);
    assert_eq!(outcome.ports, 3);

    let ports = client.list_ports()?;
    assert_eq!(slugs(&ports), ["AEAJM", "AEAUH", "AEDXB"]);
    let ajman = client.fetch_port(&PortId::parse("AEAJM")?)?;
    assert_eq!(ajman.unlocks, ["AEAJM"]);
    assert_eq!(
        ajman.coordinates.map(|c| (c.lng, c.lat)),
        Some((55.5136433, 25.4052165))
    );

    // Re-uploading the same document keeps ids stable.
    client.upload_ports(&document)?;
    let again = client.list_ports()?;
    assert_eq!(
        again.iter().map(|port| port.id).collect::<Vec<_>>(),
        ports.iter().map(|port| port.id).collect::<Vec<_>>()
    );

    drop(server);
    let snapshot: Value = serde_json::from_slice(&std::fs::read(&store)?)?;
    assert_eq!(snapshot["ports"].as_array().map(Vec::len), Some(3));
    Ok(())
}

#[test]
fn remote_malformed_upload_is_generic_internal_error() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&temp_dir.path().join("ports.json"))?;
    let client = server.client()?;
    let document = write_document(temp_dir.path(), r#"["AEAJM"]"#)?;

    let err = client.upload_ports(&document).expect_err("malformed");
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.message(), Some("internal error occurred"));
    assert!(client.list_ports()?.is_empty());
    Ok(())
}

#[test]
fn upload_without_file_field_is_bad_request() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&temp_dir.path().join("ports.json"))?;

    let boundary = "portload-test";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--{boundary}--\r\n"
    );
    let response = ureq::post(&format!("{}/upload-ports", server.base_url))
        .set(
            "Content-Type",
            &format!("multipart/form-data; boundary={boundary}"),
        )
        .send_string(&body);
    match response {
        Err(ureq::Error::Status(code, resp)) => {
            assert_eq!(code, 400);
            let value: Value = serde_json::from_str(&resp.into_string()?)?;
            assert_eq!(value["error"]["kind"], "Usage");
        }
        other => return Err(format!("expected 400, got {other:?}").into()),
    }
    Ok(())
}

#[test]
fn oversized_upload_is_rejected() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start_with_args(
        &temp_dir.path().join("ports.json"),
        &["--max-upload-bytes", "256", "--in-memory"],
    )?;
    let client = server.client()?;
    let body: Vec<String> = (0..50)
        .map(|idx| format!(r#""P{idx:03}": {{"name": "port {idx}"}}"#))
        .collect();
    let document = write_document(temp_dir.path(), &format!("{{{}}}", body.join(",")))?;

    let err = client.upload_ports(&document).expect_err("too large");
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(err.message(), Some("upload exceeds maximum size"));
    assert!(!temp_dir.path().join("ports.json").exists());
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}
