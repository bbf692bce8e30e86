//! Purpose: Hold top-level CLI command dispatch for `portload`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Local and remote targets produce the same output envelopes.

use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;

use portload::api::{
    FileStore, PipelineConfig, PortId, PortStore, RemoteClient, UploadOutcome, upload_ports,
};

use super::*;

pub(super) fn dispatch_command(command: Command, target: StoreTarget) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            use std::io::Write;
            io::stdout()
                .write_all(&completion_script(shell))
                .map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write completion script")
                        .with_source(err)
                })?;
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let store_path = match target {
                StoreTarget::Remote(_) => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("serve cannot be combined with --url")
                        .with_hint("Drop --url; serve always uses a local store."));
                }
                StoreTarget::Local(_) if args.in_memory => None,
                StoreTarget::Local(path) => Some(path),
            };
            let bind: SocketAddr = args.bind.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid bind address")
                    .with_hint("Use a host:port value like 127.0.0.1:9710.")
            })?;
            let config = serve::ServeConfig {
                bind,
                store_path,
                chunk_size: args.chunk_size,
                batch_size: args.batch_size,
                max_upload_bytes: args.max_upload_bytes,
                allow_non_loopback: args.allow_non_loopback,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Upload {
            file,
            chunk_size,
            batch_size,
        } => {
            let config = PipelineConfig::default()
                .with_chunk_size(chunk_size)
                .with_batch_size(batch_size);
            config.validate()?;
            let outcome = match &target {
                StoreTarget::Local(path) => {
                    let store = FileStore::open(path)?;
                    upload_ports(open_input(&file)?, config, &store)?
                }
                StoreTarget::Remote(url) => {
                    if is_stdin(&file) {
                        return Err(Error::new(ErrorKind::Usage)
                            .with_message("remote upload requires a file path")
                            .with_hint("Save the document to a file, then pass its path."));
                    }
                    RemoteClient::new(url.clone())?.upload_ports(&file)?
                }
            };
            emit_json(upload_json(outcome));
            Ok(RunOutcome::ok())
        }
        Command::List => {
            let ports = match &target {
                StoreTarget::Local(path) => FileStore::open(path)?.list()?,
                StoreTarget::Remote(url) => RemoteClient::new(url.clone())?.list_ports()?,
            };
            emit_json(json!({ "ports": ports }));
            Ok(RunOutcome::ok())
        }
        Command::Get { port } => {
            let id = PortId::parse(&port)?;
            let port = match &target {
                StoreTarget::Local(path) => FileStore::open(path)?.fetch(&id)?,
                StoreTarget::Remote(url) => RemoteClient::new(url.clone())?.fetch_port(&id)?,
            };
            emit_json(json!({ "port": port }));
            Ok(RunOutcome::ok())
        }
        Command::Delete { port } => {
            let id = PortId::parse(&port)?;
            match &target {
                StoreTarget::Local(path) => {
                    FileStore::open(path)?.delete(&id)?;
                }
                StoreTarget::Remote(url) => RemoteClient::new(url.clone())?.delete_port(&id)?,
            }
            emit_json(json!({ "ok": true }));
            Ok(RunOutcome::ok())
        }
    }
}

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn open_input(path: &Path) -> Result<Box<dyn Read + Send>, Error> {
    if is_stdin(path) {
        return Ok(Box::new(io::stdin()));
    }
    let file = File::open(path).map_err(|err| {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            _ => ErrorKind::Io,
        };
        Error::new(kind)
            .with_message("failed to open ports document")
            .with_path(path)
            .with_source(err)
    })?;
    Ok(Box::new(file))
}

fn upload_json(outcome: UploadOutcome) -> Value {
    json!({
        "ok": true,
        "batches": outcome.batches,
        "ports": outcome.ports,
    })
}
