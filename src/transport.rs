//! Framing and the HTTP/1.0 `CONNECT` handshake shared by client and server
//! (C3), plus the same-listener HTTP liveness sniff (C4/§6 "HTTP sideline").

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{HsyncError, Result};
use crate::protocol::{CONNECTED_STATUS, RPC_PATH};

pub async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame; `Ok(None)` means the peer closed the
/// connection cleanly between frames.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Client side of the handshake: send `CONNECT <path> HTTP/1.0` and expect
/// the `200 Connected to Go RPC` status line before any RPC frames flow.
pub async fn client_handshake(stream: &mut TcpStream) -> Result<()> {
    let req = format!("CONNECT {RPC_PATH} HTTP/1.0\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    // consume remaining header lines up to the blank line
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    if !status_line.contains(CONNECTED_STATUS) {
        return Err(HsyncError::Network(format!(
            "unexpected handshake response: {}",
            status_line.trim()
        )));
    }
    Ok(())
}

/// What kind of request arrived on the shared listener.
pub enum Accepted {
    /// A `CONNECT` handshake was completed; the socket is now an RPC stream.
    Rpc,
    /// A plain HTTP request was answered directly (liveness page); the
    /// caller should close the connection.
    Http,
}

/// Server side of the multiplexed listener: peek the request line and
/// either complete the RPC handshake or answer the liveness page.
pub async fn server_accept(stream: &mut TcpStream, version: &str) -> Result<Accepted> {
    let mut reader = BufReader::new(&mut *stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    if request_line.starts_with("CONNECT ") {
        let resp = format!("HTTP/1.0 {CONNECTED_STATUS}\r\n\r\n");
        stream.write_all(resp.as_bytes()).await?;
        stream.flush().await?;
        Ok(Accepted::Rpc)
    } else {
        let body = format!("hsyncd is ready (v{version})");
        let resp = format!(
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(resp.as_bytes()).await?;
        stream.flush().await?;
        Ok(Accepted::Http)
    }
}
