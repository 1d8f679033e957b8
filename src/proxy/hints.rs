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

//! Routing hints are PROXY protocol v2 headers. Clients speaking the legacy protocol send one to
//! name their destination; the gateway can write its own when dialing a backend. Backends must
//! only ever see the header the gateway wrote, so client supplied ones are stripped first.

use std::net::{SocketAddr, SocketAddrV6};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use ppp::v2;
use tokio::io::{self, AsyncRead, AsyncReadExt};
use tokio::time::Instant;

use crate::proxy::Error;
use crate::socket::to_canonical;

pub const SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";
const FIXED_LEN: usize = 16;
// Addresses plus a handful of TLVs; anything larger is not a header we care to parse.
const MAX_HEADER_LEN: usize = FIXED_LEN + 2048;
const PP2_TYPE_AUTHORITY: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub authority: Option<String>,
}

/// Encode the header the gateway writes to a backend.
pub fn encode(source: SocketAddr, destination: SocketAddr, authority: &str) -> io::Result<Vec<u8>> {
    let (source, destination) = same_family(to_canonical(source), to_canonical(destination));
    v2::Builder::with_addresses(
        v2::Version::Two | v2::Command::Proxy,
        v2::Protocol::Stream,
        (source, destination),
    )
    .write_tlv(PP2_TYPE_AUTHORITY, authority.as_bytes())?
    .build()
}

// PROXY v2 carries one address family per header.
fn same_family(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    fn mapped(addr: SocketAddr) -> SocketAddr {
        match addr {
            SocketAddr::V4(v4) => {
                SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
            }
            v6 => v6,
        }
    }
    if a.is_ipv4() == b.is_ipv4() {
        (a, b)
    } else {
        (mapped(a), mapped(b))
    }
}

pub fn decode(header: &[u8]) -> Result<ProxyHeader, Error> {
    let parsed = v2::Header::try_from(header).map_err(|e| Error::ProxyHeader(e.to_string()))?;
    let (source, destination) = match parsed.addresses {
        v2::Addresses::IPv4(a) => (
            SocketAddr::from((a.source_address, a.source_port)),
            SocketAddr::from((a.destination_address, a.destination_port)),
        ),
        v2::Addresses::IPv6(a) => (
            SocketAddr::from((a.source_address, a.source_port)),
            SocketAddr::from((a.destination_address, a.destination_port)),
        ),
        _ => return Err(Error::ProxyHeader("header carries no IP addresses".to_string())),
    };
    let authority = parsed
        .tlvs()
        .filter_map(Result::ok)
        .find(|tlv| tlv.kind == PP2_TYPE_AUTHORITY)
        .and_then(|tlv| String::from_utf8(tlv.value.to_vec()).ok());
    Ok(ProxyHeader {
        source: to_canonical(source),
        destination: to_canonical(destination),
        authority,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Prefix {
    /// The buffer does not start with a header.
    Absent,
    /// The buffer could still turn out to start with a header.
    Partial,
    /// A header of this total length starts the buffer.
    Header(usize),
}

fn classify(buf: &[u8]) -> Prefix {
    let n = buf.len().min(SIGNATURE.len());
    if buf[..n] != SIGNATURE[..n] {
        return Prefix::Absent;
    }
    if buf.len() < FIXED_LEN {
        return Prefix::Partial;
    }
    Prefix::Header(FIXED_LEN + u16::from_be_bytes([buf[14], buf[15]]) as usize)
}

enum Fill {
    Data,
    Eof,
    Timeout,
}

async fn fill<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut BytesMut,
    deadline: Instant,
) -> io::Result<Fill> {
    buf.reserve(512);
    match tokio::time::timeout_at(deadline, r.read_buf(buf)).await {
        Ok(Ok(0)) => Ok(Fill::Eof),
        Ok(Ok(_)) => Ok(Fill::Data),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Fill::Timeout),
    }
}

/// Read the header a legacy client must send first. Bytes after it stay in `buf`.
pub async fn read_header<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<ProxyHeader, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        match classify(buf) {
            Prefix::Absent => return Err(Error::ProxyHeader("missing PROXY v2 header".to_string())),
            Prefix::Header(total) if total > MAX_HEADER_LEN => {
                return Err(Error::ProxyHeader(format!("header of {total} bytes is too large")));
            }
            Prefix::Header(total) if buf.len() >= total => {
                let header = decode(&buf[..total])?;
                buf.advance(total);
                return Ok(header);
            }
            Prefix::Partial | Prefix::Header(_) => {}
        }
        match fill(r, buf, deadline).await? {
            Fill::Data => {}
            Fill::Eof => return Err(Error::ClientDisconnected),
            Fill::Timeout => return Err(Error::MatchTimeout),
        }
    }
}

/// Remove every PROXY v2 header at the front of the client's payload, reading more if the
/// buffered bytes could be the start of one. Returns how many were removed.
///
/// A client that stops mid-header is refused rather than forwarded, since the remainder could
/// reach the backend after the gateway's own header.
pub async fn strip_forged<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<usize, Error> {
    let deadline = Instant::now() + timeout;
    let mut stripped = 0;
    loop {
        match classify(buf) {
            Prefix::Absent => return Ok(stripped),
            Prefix::Header(total) if total > MAX_HEADER_LEN => {
                return Err(Error::ProxyHeader(format!("header of {total} bytes is too large")));
            }
            Prefix::Header(total) if buf.len() >= total => {
                buf.advance(total);
                stripped += 1;
                continue;
            }
            Prefix::Partial | Prefix::Header(_) => {}
        }
        match fill(r, buf, deadline).await? {
            Fill::Data => {}
            // Nothing sent yet is nothing to forward.
            Fill::Timeout | Fill::Eof if buf.is_empty() => return Ok(stripped),
            Fill::Timeout => return Err(Error::MatchTimeout),
            Fill::Eof => return Err(Error::ProxyHeader("truncated PROXY v2 header".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use tokio::io::AsyncWriteExt;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn encode_decode() {
        let h = encode(addr("10.1.1.1:5000"), addr("10.2.2.2:443"), "outbound|443||x").unwrap();
        assert!(h.starts_with(&SIGNATURE));
        assert_eq!(classify(&h), Prefix::Header(h.len()));
        let decoded = decode(&h).unwrap();
        assert_eq!(decoded.source, addr("10.1.1.1:5000"));
        assert_eq!(decoded.destination, addr("10.2.2.2:443"));
        assert_eq!(decoded.authority.as_deref(), Some("outbound|443||x"));
    }

    #[test]
    fn mixed_families_are_mapped() {
        let h = encode(addr("10.1.1.1:5000"), addr("[2001:db8::1]:443"), "x").unwrap();
        let decoded = decode(&h).unwrap();
        // Decoding canonicalizes the mapped address back.
        assert_eq!(decoded.source, addr("10.1.1.1:5000"));
        assert_eq!(decoded.destination, addr("[2001:db8::1]:443"));
    }

    #[test]
    fn classify_prefixes() {
        assert_eq!(classify(b""), Prefix::Partial);
        assert_eq!(classify(&SIGNATURE[..5]), Prefix::Partial);
        assert_eq!(classify(b"\x16\x03\x01"), Prefix::Absent);
        assert_eq!(classify(b"\r\n\r\nX"), Prefix::Absent);
    }

    #[tokio::test]
    async fn read_header_keeps_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut data = encode(addr("10.1.1.1:5000"), addr("10.2.2.2:443"), "a").unwrap();
        data.extend(b"payload");
        client.write_all(&data).await.unwrap();
        let mut buf = BytesMut::new();
        let h = read_header(&mut server, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.destination, addr("10.2.2.2:443"));
        assert_eq!(&buf[..], b"payload");
    }

    #[tokio::test]
    async fn read_header_requires_header() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"\x16\x03\x01hello").await.unwrap();
        let mut buf = BytesMut::new();
        assert_matches!(
            read_header(&mut server, &mut buf, Duration::from_secs(1)).await,
            Err(Error::ProxyHeader(_))
        );
    }

    #[tokio::test]
    async fn strips_stacked_headers() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut data = encode(addr("1.1.1.1:1"), addr("2.2.2.2:2"), "forged-1").unwrap();
        data.extend(encode(addr("3.3.3.3:3"), addr("4.4.4.4:4"), "forged-2").unwrap());
        data.extend(b"\x16\x03\x01");
        // Deliver in small pieces so the reader has to come back for more.
        let writer = tokio::spawn(async move {
            for chunk in data.chunks(7) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });
        let mut buf = BytesMut::new();
        let n = strip_forged(&mut server, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(n, 2);
        let _client = writer.await.unwrap();
        // The rest of the payload may or may not have been read yet, but it is never a header.
        assert!(buf.is_empty() || buf.starts_with(b"\x16"));
    }

    #[tokio::test]
    async fn strip_nothing_when_client_waits() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let mut buf = BytesMut::new();
        let n = strip_forged(&mut server, &mut buf, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn truncated_forged_header_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&SIGNATURE[..8]).await.unwrap();
        drop(client);
        let mut buf = BytesMut::new();
        assert_matches!(
            strip_forged(&mut server, &mut buf, Duration::from_secs(1)).await,
            Err(Error::ProxyHeader(_))
        );
    }
}
