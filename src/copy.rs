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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::proxy::Error;

/// Which way bytes are flowing, relative to the client that opened the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

/// Transfer receives the byte accounting for a copy and reports how long it has been quiet.
pub trait Transfer: Sync {
    fn record(&self, direction: Direction, bytes: u64);
    fn idle_for(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct CopyTimeouts {
    /// Tear the tunnel down after this long without bytes in either direction.
    pub idle: Duration,
    /// After one direction finishes, how long the other may keep going.
    pub linger: Duration,
}

// Buffers start small and grow once a connection has moved enough data to look like bulk transfer.
const INITIAL_BUFFER_SIZE: usize = 1024;
const LARGE_BUFFER_SIZE: usize = 16 * 1024;
const RESIZE_THRESHOLD: u64 = 128 * 1024;

/// copy_bidirectional relays bytes between the client and the backend, verbatim, until both
/// directions finish or the idle timeout fires.
///
/// When one direction reaches EOF its write side is shut down, and the other direction is given
/// `linger` to finish on its own.
pub async fn copy_bidirectional<A, B, T>(
    downstream: A,
    upstream: B,
    transfer: &T,
    timeouts: CopyTimeouts,
) -> Result<(), Error>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    T: Transfer,
{
    let (rd, mut wd) = io::split(downstream);
    let (ru, mut wu) = io::split(upstream);
    let mut rd = BufReader::new(rd);
    let mut ru = BufReader::new(ru);

    let client_to_backend = async {
        let res = copy_buf(&mut rd, &mut wu, transfer, Direction::Upstream).await;
        trace!(?res, "upstream finished");
        ignore_shutdown_errors(wu.shutdown().await)?;
        res
    };
    let backend_to_client = async {
        let res = copy_buf(&mut ru, &mut wd, transfer, Direction::Downstream).await;
        trace!(?res, "downstream finished");
        ignore_shutdown_errors(wd.shutdown().await)?;
        res
    };
    tokio::pin!(client_to_backend, backend_to_client);

    let both = async {
        tokio::select! {
            sent = &mut client_to_backend => {
                let received = linger(timeouts.linger, &mut backend_to_client).await;
                (sent, received)
            }
            received = &mut backend_to_client => {
                let sent = linger(timeouts.linger, &mut client_to_backend).await;
                (sent, received)
            }
        }
    };
    let (sent, received) = tokio::select! {
        res = both => res,
        idle = idle_expired(transfer, timeouts.idle) => return Err(Error::IdleTimeout(idle)),
    };

    let sent = sent.map_err(|e| match e.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => Error::BackendDisconnected,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => Error::ClientDisconnected,
        _ => e.into(),
    })?;
    let received = received.map_err(|e| match e.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => Error::ClientDisconnected,
        io::ErrorKind::ConnectionReset => Error::BackendDisconnected,
        _ => e.into(),
    })?;
    trace!(sent, received, "copy complete");
    Ok(())
}

// A direction still running when the linger window closes is abandoned, not an error.
async fn linger<F>(timeout: Duration, remaining: F) -> io::Result<u64>
where
    F: Future<Output = io::Result<u64>>,
{
    match tokio::time::timeout(timeout, remaining).await {
        Ok(res) => res,
        Err(_) => {
            trace!("linger expired with the other direction still open");
            Ok(0)
        }
    }
}

async fn idle_expired<T: Transfer>(transfer: &T, idle: Duration) -> Duration {
    loop {
        let quiet = transfer.idle_for();
        if quiet >= idle {
            return quiet;
        }
        tokio::time::sleep(idle - quiet).await;
    }
}

// The peer may already be gone when we shut down our write side; that is not worth reporting.
fn ignore_shutdown_errors(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
            ) =>
        {
            Ok(())
        }
        res => res,
    }
}

async fn copy_buf<R, W, T>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    transfer: &T,
    direction: Direction,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Transfer,
{
    CopyBuf {
        reader,
        writer,
        transfer,
        direction,
        amt: 0,
    }
    .await
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
struct CopyBuf<'a, R, W, T> {
    reader: &'a mut BufReader<R>,
    writer: &'a mut W,
    transfer: &'a T,
    direction: Direction,
    amt: u64,
}

impl<R, W, T> Future for CopyBuf<'_, R, W, T>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Transfer,
{
    type Output = io::Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let me = &mut *self;
            let buffer = ready!(Pin::new(&mut *me.reader).poll_fill_buf(cx))?;
            if buffer.is_empty() {
                ready!(Pin::new(&mut *me.writer).poll_flush(cx))?;
                return Poll::Ready(Ok(me.amt));
            }
            let n = ready!(Pin::new(&mut *me.writer).poll_write(cx, buffer))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            me.transfer.record(me.direction, n as u64);
            let before = me.amt;
            me.amt += n as u64;
            if before < RESIZE_THRESHOLD && me.amt >= RESIZE_THRESHOLD {
                Pin::new(&mut *me.reader).grow();
            }
            Pin::new(&mut *me.reader).consume(n);
        }
    }
}

pin_project! {
    /// A read buffer that can grow once, keeping any unread bytes.
    struct BufReader<R> {
        #[pin]
        inner: R,
        buf: Box<[u8]>,
        pos: usize,
        cap: usize,
    }
}

impl<R: AsyncRead> BufReader<R> {
    fn new(inner: R) -> Self {
        BufReader {
            inner,
            buf: vec![0; INITIAL_BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            cap: 0,
        }
    }

    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let me = self.project();
        if *me.pos >= *me.cap {
            let mut buf = io::ReadBuf::new(me.buf);
            ready!(me.inner.poll_read(cx, &mut buf))?;
            *me.cap = buf.filled().len();
            *me.pos = 0;
        }
        Poll::Ready(Ok(&me.buf[*me.pos..*me.cap]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let me = self.project();
        *me.pos = (*me.pos + amt).min(*me.cap);
    }

    fn grow(self: Pin<&mut Self>) {
        let me = self.project();
        if me.buf.len() >= LARGE_BUFFER_SIZE {
            return;
        }
        let mut larger = vec![0u8; LARGE_BUFFER_SIZE].into_boxed_slice();
        larger[..me.buf.len()].copy_from_slice(me.buf);
        *me.buf = larger;
        trace!("resized buffer to {LARGE_BUFFER_SIZE}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::time::Instant;

    struct Counter {
        up: AtomicU64,
        down: AtomicU64,
        last: Mutex<Instant>,
    }

    impl Counter {
        fn new() -> Self {
            Counter {
                up: AtomicU64::new(0),
                down: AtomicU64::new(0),
                last: Mutex::new(Instant::now()),
            }
        }
    }

    impl Transfer for Counter {
        fn record(&self, direction: Direction, bytes: u64) {
            match direction {
                Direction::Upstream => self.up.fetch_add(bytes, Ordering::Relaxed),
                Direction::Downstream => self.down.fetch_add(bytes, Ordering::Relaxed),
            };
            *self.last.lock().unwrap() = Instant::now();
        }

        fn idle_for(&self) -> Duration {
            self.last.lock().unwrap().elapsed()
        }
    }

    const TIMEOUTS: CopyTimeouts = CopyTimeouts {
        idle: Duration::from_secs(60),
        linger: Duration::from_secs(1),
    };

    #[tokio::test]
    async fn copies_both_directions_verbatim() {
        let (client, gw_client) = duplex(64);
        let (gw_backend, backend) = duplex(64);
        let counter = Counter::new();

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let backend_task = tokio::spawn(async move {
            let (mut r, mut w) = io::split(backend);
            let mut got = Vec::new();
            r.read_to_end(&mut got).await.unwrap();
            w.write_all(b"bye").await.unwrap();
            w.shutdown().await.unwrap();
            got
        });
        let client_task = tokio::spawn(async move {
            let (mut r, mut w) = io::split(client);
            w.write_all(&payload).await.unwrap();
            w.shutdown().await.unwrap();
            let mut got = Vec::new();
            r.read_to_end(&mut got).await.unwrap();
            got
        });

        copy_bidirectional(gw_client, gw_backend, &counter, TIMEOUTS)
            .await
            .unwrap();
        assert_eq!(backend_task.await.unwrap(), expected);
        assert_eq!(client_task.await.unwrap(), b"bye");
        assert_eq!(counter.up.load(Ordering::Relaxed), 300_000);
        assert_eq!(counter.down.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout() {
        let (_client, gw_client) = duplex(64);
        let (gw_backend, _backend) = duplex(64);
        let counter = Counter::new();
        let timeouts = CopyTimeouts {
            idle: Duration::from_secs(10),
            linger: Duration::from_secs(1),
        };
        let res = copy_bidirectional(gw_client, gw_backend, &counter, timeouts).await;
        assert!(matches!(res, Err(Error::IdleTimeout(d)) if d >= Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn linger_bounds_half_close() {
        let (client, gw_client) = duplex(64);
        let (gw_backend, _backend) = duplex(64);
        let counter = Counter::new();
        // Client closes; the backend never answers or closes.
        drop(client);
        let start = Instant::now();
        copy_bidirectional(gw_client, gw_backend, &counter, TIMEOUTS)
            .await
            .unwrap();
        assert!(start.elapsed() >= TIMEOUTS.linger);
        assert!(start.elapsed() < TIMEOUTS.idle);
    }
}
