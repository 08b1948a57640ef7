//! Wire messages for the RPC transport (C3).
//!
//! Framing: a persistent TCP stream carries, after the `CONNECT` handshake
//! (see [`crate::transport`]), a sequence of `u32_be(len) || bincode(Frame)`
//! messages in both directions. Calls and replies are correlated by `id`.

use serde::{Deserialize, Serialize};

use crate::codec::{FileChunk, FileStat, FileStatSlice};

pub const RPC_PATH: &str = "/_goRPC_";
pub const CONNECTED_STATUS: &str = "200 Connected to Go RPC";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcArgs {
    pub token: String,
    pub file_name: String,
    pub file: Option<FileChunk>,
}

impl RpcArgs {
    pub fn new(token: impl Into<String>, file_name: impl Into<String>, file: Option<FileChunk>) -> Self {
        Self {
            token: token.into(),
            file_name: file_name.into(),
            file,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: i64,
}

/// The method table from spec.md §4.3, bound to their argument payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Call {
    Version(String),
    FileStat(RpcArgs),
    FileStatSlice(RpcArgs),
    CopyFile(RpcArgs),
    DeleteFile(RpcArgs),
    FileReName(RpcArgs),
    FileTruncate(RpcArgs),
    DirList(RpcArgs),
}

impl Call {
    pub fn method_name(&self) -> &'static str {
        match self {
            Call::Version(_) => "Trans.Version",
            Call::FileStat(_) => "Trans.FileStat",
            Call::FileStatSlice(_) => "Trans.FileStatSlice",
            Call::CopyFile(_) => "Trans.CopyFile",
            Call::DeleteFile(_) => "Trans.DeleteFile",
            Call::FileReName(_) => "Trans.FileReName",
            Call::FileTruncate(_) => "Trans.FileTruncate",
            Call::DirList(_) => "Trans.DirList",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Version(String),
    Stat(FileStat),
    StatSlice(FileStatSlice),
    Int(i64),
    DirList(Vec<DirEntry>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<Reply, String>,
}

pub fn encode<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).expect("serialize wire message")
}

pub fn decode<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> crate::error::Result<T> {
    bincode::deserialize(buf)
        .map_err(|e| crate::error::HsyncError::Protocol(format!("decode failed: {e}")))
}
