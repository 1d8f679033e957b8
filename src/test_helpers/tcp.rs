// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::trace;

use crate::proxy::hints::{self, ProxyHeader};

/// EchoServer writes back everything it receives. A PROXY header at the start of a connection is
/// consumed rather than echoed, and reported on the channel returned by [EchoServer::new].
pub struct EchoServer {
    listener: TcpListener,
    headers: mpsc::UnboundedSender<Option<ProxyHeader>>,
}

impl EchoServer {
    pub async fn new() -> (EchoServer, mpsc::UnboundedReceiver<Option<ProxyHeader>>) {
        let listener = TcpListener::bind(super::localhost()).await.unwrap();
        let (headers, rx) = mpsc::unbounded_channel();
        (EchoServer { listener, headers }, rx)
    }

    pub fn address(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Run in the background, returning the address to dial.
    pub fn spawn(self) -> SocketAddr {
        let address = self.address();
        tokio::spawn(self.run());
        address
    }

    pub async fn run(self) {
        loop {
            let (mut socket, _) = self.listener.accept().await.unwrap();
            let headers = self.headers.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                // Anything that is not a header stays buffered and is echoed below.
                let header = hints::read_header(&mut socket, &mut buf, Duration::from_secs(5))
                    .await
                    .ok();
                let _ = headers.send(header);
                if socket.write_all(&buf).await.is_err() {
                    return;
                }
                let mut buf = vec![0; 64 * 1024];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    trace!("echo received {n}");
                    if socket.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    }
}

/// Send `payload` and read back exactly as many bytes.
pub async fn echo_round_trip<S>(stream: &mut S, payload: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    let mut got = vec![0; payload.len()];
    stream.read_exact(&mut got).await.unwrap();
    got
}

/// Send a CONNECT request with the given extra headers and read the response head, leaving
/// anything after it on the stream.
pub async fn connect_request(
    gateway: SocketAddr,
    authority: &str,
    headers: &[(&str, &str)],
) -> (u16, TcpStream) {
    let mut stream = TcpStream::connect(gateway).await.unwrap();
    let mut req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    (status_of(&head), stream)
}

/// Read an HTTP response head one byte at a time, so the body or tunnel payload is left unread.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let b = stream.read_u8().await.unwrap();
        head.push(b);
    }
    String::from_utf8(head).unwrap()
}

pub fn status_of(head: &str) -> u16 {
    head.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("no status in {head:?}"))
}
