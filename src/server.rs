//! Token auth, path canonicalization and the RPC method handlers (C4).

use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use crate::codec;
use crate::config::{ServerConf, VERSION};
use crate::deploy::{DeployKind, DeployQueue};
use crate::error::{HsyncError, Result};
use crate::pathutil::check_path;
use crate::protocol::{Call, DirEntry, Reply, Request, Response, RpcArgs};
use crate::transport::{self, Accepted};

pub struct Server {
    conf: Arc<ServerConf>,
    queue: Arc<DeployQueue>,
}

impl Server {
    pub fn new(conf: Arc<ServerConf>, queue: Arc<DeployQueue>) -> Self {
        Self { conf, queue }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.conf.addr)
            .await
            .map_err(|e| HsyncError::Network(format!("bind {}: {e}", self.conf.addr)))?;
        tracing::info!(addr = %self.conf.addr, home = %self.conf.home.display(), "hsyncd listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_conn(stream).await {
                    tracing::debug!(peer = %peer, error = %e, "connection closed");
                }
            });
        }
    }

    pub async fn handle_conn(&self, mut stream: TcpStream) -> Result<()> {
        match transport::server_accept(&mut stream, VERSION).await? {
            Accepted::Http => Ok(()),
            Accepted::Rpc => self.serve_requests(stream).await,
        }
    }

    async fn serve_requests(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let Some(bytes) = transport::read_frame(&mut stream).await? else {
                return Ok(());
            };
            let req: Request = crate::protocol::decode(&bytes)?;
            let result = self.dispatch(req.call).await.map_err(|e| e.to_string());
            let resp = Response { id: req.id, result };
            transport::write_frame(&mut stream, &crate::protocol::encode(&resp)).await?;
        }
    }

    async fn dispatch(&self, call: Call) -> Result<Reply> {
        match call {
            Call::Version(client_version) => {
                tracing::debug!(client_version, "version handshake");
                Ok(Reply::Version(VERSION.to_string()))
            }
            Call::FileStat(args) => self.handle_file_stat(args).await,
            Call::FileStatSlice(args) => self.handle_file_stat_slice(args).await,
            Call::CopyFile(args) => self.handle_copy_file(args).await,
            Call::DeleteFile(args) => self.handle_delete_file(args).await,
            Call::FileReName(args) => self.handle_file_rename(args).await,
            Call::FileTruncate(args) => self.handle_file_truncate(args).await,
            Call::DirList(args) => self.handle_dir_list(args).await,
        }
    }

    fn authenticate(&self, args: &RpcArgs) -> Result<()> {
        if args.token != self.conf.token {
            return Err(HsyncError::Auth);
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<(std::path::PathBuf, String)> {
        check_path(&self.conf.home, name)
    }

    async fn handle_file_stat(&self, args: RpcArgs) -> Result<Reply> {
        self.authenticate(&args)?;
        let (abs, _rel) = self.resolve(&args.file_name)?;
        Ok(Reply::Stat(codec::file_get_stat(&abs, true)?))
    }

    async fn handle_file_stat_slice(&self, args: RpcArgs) -> Result<Reply> {
        self.authenticate(&args)?;
        let (abs, _rel) = self.resolve(&args.file_name)?;
        Ok(Reply::StatSlice(codec::file_get_stat_slice(&abs)?))
    }

    /// The `CopyFile` receiver: directory creation, parent creation,
    /// existing-non-directory removal, gzip decode, write-at-offset and a
    /// final truncate to the announced size on the last chunk.
    async fn handle_copy_file(&self, args: RpcArgs) -> Result<Reply> {
        self.authenticate(&args)?;
        let (abs, rel) = self.resolve(&args.file_name)?;
        let chunk = args
            .file
            .ok_or_else(|| HsyncError::Protocol("CopyFile missing file chunk".into()))?;
        let mode = if chunk.stat.mode != 0 { chunk.stat.mode } else { 0o644 };

        if chunk.stat.is_dir {
            replace_non_dir(&abs)?;
            codec::ensure_dir(&abs, if mode != 0 { mode } else { 0o755 })?;
            self.queue.enqueue(rel, DeployKind::Update).await;
            return Ok(Reply::Int(0));
        }

        if let Some(parent) = abs.parent() {
            codec::ensure_dir(parent, 0o755)?;
        }
        if abs.is_dir() {
            std::fs::remove_dir_all(&abs)?;
        }
        let data = if chunk.gzip {
            codec::gzip_decode(&chunk.data)
        } else {
            chunk.data
        };
        codec::write_chunk_at(&abs, mode, &data, chunk.pos)?;
        if chunk.index + 1 >= chunk.total {
            codec::truncate_to(&abs, chunk.stat.size)?;
            self.queue.enqueue(rel, DeployKind::Update).await;
        }
        Ok(Reply::Int(0))
    }

    async fn handle_delete_file(&self, args: RpcArgs) -> Result<Reply> {
        self.authenticate(&args)?;
        let (abs, rel) = self.resolve(&args.file_name)?;
        match std::fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&abs)?,
            Ok(_) => std::fs::remove_file(&abs)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.queue.enqueue(rel, DeployKind::Delete).await;
        Ok(Reply::Int(0))
    }

    async fn handle_file_rename(&self, args: RpcArgs) -> Result<Reply> {
        self.authenticate(&args)?;
        let (old_abs, old_rel) = self.resolve(&args.file_name)?;
        let chunk = args
            .file
            .ok_or_else(|| HsyncError::Protocol("FileReName missing destination".into()))?;
        let (new_abs, new_rel) = self.resolve(&chunk.name)?;
        if let Some(parent) = new_abs.parent() {
            codec::ensure_dir(parent, 0o755)?;
        }
        std::fs::rename(&old_abs, &new_abs)?;
        self.queue.enqueue(old_rel, DeployKind::Delete).await;
        self.queue.enqueue(new_rel, DeployKind::Update).await;
        Ok(Reply::Int(0))
    }

    async fn handle_file_truncate(&self, args: RpcArgs) -> Result<Reply> {
        self.authenticate(&args)?;
        let (abs, rel) = self.resolve(&args.file_name)?;
        let chunk = args
            .file
            .ok_or_else(|| HsyncError::Protocol("FileTruncate missing stat".into()))?;
        codec::truncate_to(&abs, chunk.stat.size)?;
        self.queue.enqueue(rel, DeployKind::Update).await;
        Ok(Reply::Int(0))
    }

    async fn handle_dir_list(&self, args: RpcArgs) -> Result<Reply> {
        self.authenticate(&args)?;
        let (abs, _rel) = self.resolve(&args.file_name)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&abs)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len() as i64,
            });
        }
        Ok(Reply::DirList(entries))
    }
}

fn replace_non_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => std::fs::remove_file(path),
        _ => Ok(()),
    }
}
