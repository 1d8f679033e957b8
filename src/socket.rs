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

use socket2::{SockRef, TcpKeepalive};
use tokio::io;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::trace;

use crate::config::SocketConfig;

pub fn to_canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from((addr.ip().to_canonical(), addr.port()))
}

/// Apply the configured TCP options to a stream, accepted or dialed.
pub fn set_socket_options(stream: &TcpStream, cfg: &SocketConfig) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if cfg.keepalive_enabled {
        let ka = TcpKeepalive::new()
            .with_time(cfg.keepalive_time)
            .with_interval(cfg.keepalive_interval)
            .with_retries(cfg.keepalive_retries);
        let res = SockRef::from(stream).set_tcp_keepalive(&ka);
        trace!("set keepalive: {res:?}");
    }
    Ok(())
}

/// Connect to `addr` within `timeout`. Names are resolved by the runtime.
pub async fn dial<A: ToSocketAddrs>(
    addr: A,
    timeout: Duration,
    cfg: &SocketConfig,
) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    set_socket_options(&stream, cfg)?;
    Ok(stream)
}

/// Listener wraps a TcpListener, applying socket options to every accepted connection.
pub struct Listener {
    listener: TcpListener,
    cfg: SocketConfig,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, cfg: SocketConfig) -> io::Result<Self> {
        Ok(Listener {
            listener: TcpListener::bind(addr).await?,
            cfg,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        set_socket_options(&stream, &self.cfg)?;
        Ok((stream, to_canonical(remote)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:80".parse().unwrap();
        assert_eq!(to_canonical(mapped), "127.0.0.1:80".parse().unwrap());
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(to_canonical(v6), v6);
    }

    #[tokio::test]
    async fn dial_refused() {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        drop(l);
        let res = dial(addr, Duration::from_secs(1), &SocketConfig::default()).await;
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::ConnectionRefused);
    }
}
