//! End-to-end exercise of the wire protocol: a real `Server` on a loopback
//! listener, driven by a bare client connection (handshake, `CopyFile`,
//! `FileStat`, `FileStatSlice`, `FileReName`, `DeleteFile`, `DirList`).

use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::net::TcpStream;

use hsync::codec::{self, FileChunk, CHUNK_SIZE};
use hsync::config::ServerConf;
use hsync::deploy::DeployQueue;
use hsync::protocol::{Call, Reply, Request, Response, RpcArgs};
use hsync::server::Server;
use hsync::transport;

const TOKEN: &str = "test-token";

async fn start_server(home: &Path) -> String {
    let conf = Arc::new(ServerConf {
        addr: "127.0.0.1:0".to_string(),
        home: home.to_path_buf(),
        token: TOKEN.to_string(),
        deploy: Vec::new(),
        deploy_cmd: String::new(),
        conf_dir: home.to_path_buf(),
    });
    let listener = tokio::net::TcpListener::bind(&conf.addr).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let queue = DeployQueue::new();
    let server = Arc::new(Server::new(conf, queue));
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.handle_conn(stream).await;
            });
        }
    });
    addr
}

async fn connect(addr: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    transport::client_handshake(&mut stream).await.unwrap();
    stream
}

async fn call(stream: &mut TcpStream, id: u64, call: Call) -> Response {
    let req = Request { id, call };
    transport::write_frame(stream, &hsync::protocol::encode(&req)).await.unwrap();
    let bytes = transport::read_frame(stream).await.unwrap().expect("reply");
    hsync::protocol::decode(&bytes).unwrap()
}

#[tokio::test]
async fn version_handshake_round_trips() {
    let dir = tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut stream = connect(&addr).await;

    let resp = call(&mut stream, 1, Call::Version("v1".into())).await;
    match resp.result.unwrap() {
        Reply::Version(v) => assert!(!v.is_empty()),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn copy_file_then_stat_round_trips_small_file() {
    let dir = tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut stream = connect(&addr).await;

    let data = b"hello hsync".to_vec();
    let chunk = FileChunk {
        name: String::new(),
        data: codec::gzip_encode(&data),
        stat: codec::FileStat {
            exists: true,
            mtime: None,
            size: data.len() as i64,
            mode: 0o644,
            is_dir: false,
            is_fifo: false,
            md5: Some(codec::byte_md5(&data)),
        },
        gzip: true,
        total: 1,
        index: 0,
        pos: 0,
    };
    let args = RpcArgs::new(TOKEN, "a/b.txt", Some(chunk));
    let resp = call(&mut stream, 1, Call::CopyFile(args)).await;
    resp.result.expect("copy succeeds");

    assert_eq!(std::fs::read(dir.path().join("a/b.txt")).unwrap(), data);

    let resp = call(&mut stream, 2, Call::FileStat(RpcArgs::new(TOKEN, "a/b.txt", None))).await;
    match resp.result.unwrap() {
        Reply::Stat(stat) => {
            assert!(stat.exists);
            assert_eq!(stat.size, data.len() as i64);
            assert_eq!(stat.md5.as_deref(), Some(codec::byte_md5(&data).as_str()));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let dir = tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut stream = connect(&addr).await;

    let resp = call(&mut stream, 1, Call::FileStat(RpcArgs::new("bad-token", "a.txt", None))).await;
    assert!(resp.result.is_err());
}

#[tokio::test]
async fn rename_then_delete_round_trip() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("old.txt"), b"data").unwrap();
    let addr = start_server(dir.path()).await;
    let mut stream = connect(&addr).await;

    let rename_chunk = FileChunk {
        name: "new.txt".into(),
        data: Vec::new(),
        stat: Default::default(),
        gzip: false,
        total: 0,
        index: 0,
        pos: 0,
    };
    let resp = call(
        &mut stream,
        1,
        Call::FileReName(RpcArgs::new(TOKEN, "old.txt", Some(rename_chunk))),
    )
    .await;
    resp.result.expect("rename succeeds");
    assert!(!dir.path().join("old.txt").exists());
    assert!(dir.path().join("new.txt").exists());

    let resp = call(&mut stream, 2, Call::DeleteFile(RpcArgs::new(TOKEN, "new.txt", None))).await;
    resp.result.expect("delete succeeds");
    assert!(!dir.path().join("new.txt").exists());
}

#[tokio::test]
async fn dir_list_reports_entries() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/a.txt"), b"12345").unwrap();
    let addr = start_server(dir.path()).await;
    let mut stream = connect(&addr).await;

    let resp = call(&mut stream, 1, Call::DirList(RpcArgs::new(TOKEN, "sub", None))).await;
    match resp.result.unwrap() {
        Reply::DirList(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].name, "a.txt");
            assert_eq!(entries[0].size, 5);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn flash_send_diffs_unchanged_chunks_via_stat_slice() {
    let dir = tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut stream = connect(&addr).await;

    // Two full chunks plus a partial third so FileStatSlice has >1 part.
    let data = vec![9u8; (CHUNK_SIZE as usize) * 2 + 17];
    let slice = {
        std::fs::write(dir.path().join("src.bin"), &data).unwrap();
        codec::file_get_stat_slice(&dir.path().join("src.bin")).unwrap()
    };

    for index in 0..slice.total {
        let chunk = codec::file_get_my_file(&dir.path().join("src.bin"), index).unwrap();
        let args = RpcArgs::new(TOKEN, "dest.bin", Some(chunk));
        let resp = call(&mut stream, index as u64 + 1, Call::CopyFile(args)).await;
        resp.result.expect("copy chunk succeeds");
    }

    assert_eq!(std::fs::read(dir.path().join("dest.bin")).unwrap(), data);

    let resp = call(
        &mut stream,
        99,
        Call::FileStatSlice(RpcArgs::new(TOKEN, "dest.bin", None)),
    )
    .await;
    match resp.result.unwrap() {
        Reply::StatSlice(remote) => {
            assert_eq!(remote.total, slice.total);
            assert_eq!(remote.parts.len(), slice.parts.len());
            for (a, b) in remote.parts.iter().zip(slice.parts.iter()) {
                assert_eq!(a.md5, b.md5);
            }
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}
