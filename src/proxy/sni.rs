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

//! Just enough TLS parsing to find the server name in a ClientHello, without consuming it:
//! everything read here is replayed to the backend.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    /// A ClientHello naming this (lowercased, trailing dot removed) server.
    Sni(String),
    /// A well-formed ClientHello without a server name.
    NoSni,
    /// Not TLS at all. `http` is set when the bytes look like an HTTP request line.
    NotTls { http: bool },
    /// More bytes are needed to decide.
    Incomplete,
    Malformed,
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (b, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(*b)
    }

    fn u16(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Some(head)
    }

    fn take_u8_prefixed(&mut self) -> Option<&'a [u8]> {
        let n = self.u8()? as usize;
        self.take(n)
    }

    fn take_u16_prefixed(&mut self) -> Option<&'a [u8]> {
        let n = self.u16()? as usize;
        self.take(n)
    }
}

fn looks_like_http(data: &[u8]) -> bool {
    // An HTTP/1 request starts with an upper case method token and a space.
    let method_len = data.iter().take_while(|b| b.is_ascii_uppercase()).count();
    (3..=7).contains(&method_len) && data.get(method_len) == Some(&b' ')
}

/// Parse a (possibly partial) buffer holding the first bytes a client sent.
pub fn parse_sni(data: &[u8]) -> Sniff {
    match data.first() {
        None => return Sniff::Incomplete,
        Some(&CONTENT_TYPE_HANDSHAKE) => {}
        Some(_) => {
            return if data.len() < 8 && data.iter().all(u8::is_ascii_uppercase) {
                Sniff::Incomplete
            } else {
                Sniff::NotTls {
                    http: looks_like_http(data),
                }
            };
        }
    }

    // A ClientHello may be split over several handshake records; stitch them together.
    let mut handshake = Vec::new();
    let mut rest = data;
    loop {
        if rest.len() < RECORD_HEADER_LEN {
            return Sniff::Incomplete;
        }
        if rest[0] != CONTENT_TYPE_HANDSHAKE {
            return Sniff::Malformed;
        }
        let len = u16::from_be_bytes([rest[3], rest[4]]) as usize;
        if len == 0 {
            return Sniff::Malformed;
        }
        let Some(fragment) = rest.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len) else {
            return Sniff::Incomplete;
        };
        handshake.extend_from_slice(fragment);
        rest = &rest[RECORD_HEADER_LEN + len..];

        if handshake.len() < 4 {
            continue;
        }
        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return Sniff::Malformed;
        }
        let body_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
        if handshake.len() >= 4 + body_len {
            return parse_client_hello(&handshake[4..4 + body_len]);
        }
    }
}

fn parse_client_hello(body: &[u8]) -> Sniff {
    let mut c = Cursor(body);
    let parsed = (|| {
        c.take(2)?; // legacy version
        c.take(32)?; // random
        c.take_u8_prefixed()?; // session id
        c.take_u16_prefixed()?; // cipher suites
        c.take_u8_prefixed()?; // compression methods
        Some(())
    })();
    if parsed.is_none() {
        return Sniff::Malformed;
    }
    if c.0.is_empty() {
        return Sniff::NoSni;
    }
    let Some(extensions) = c.take_u16_prefixed() else {
        return Sniff::Malformed;
    };
    let mut exts = Cursor(extensions);
    while !exts.0.is_empty() {
        let (Some(kind), Some(value)) = (exts.u16(), exts.take_u16_prefixed()) else {
            return Sniff::Malformed;
        };
        if kind == EXTENSION_SERVER_NAME {
            return parse_server_name(value);
        }
    }
    Sniff::NoSni
}

fn parse_server_name(value: &[u8]) -> Sniff {
    let mut c = Cursor(value);
    let Some(list) = c.take_u16_prefixed() else {
        return Sniff::Malformed;
    };
    let mut names = Cursor(list);
    while !names.0.is_empty() {
        let (Some(kind), Some(name)) = (names.u8(), names.take_u16_prefixed()) else {
            return Sniff::Malformed;
        };
        if kind != NAME_TYPE_HOST {
            continue;
        }
        return match std::str::from_utf8(name) {
            Ok(n) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_graphic()) => {
                Sniff::Sni(n.trim_end_matches('.').to_ascii_lowercase())
            }
            _ => Sniff::Malformed,
        };
    }
    Sniff::NoSni
}

/// Read from `stream` until the ClientHello can be judged, `max_bytes` have been buffered, or
/// `timeout` passes. Returns the verdict and every byte read.
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_bytes: usize,
    timeout: Duration,
) -> io::Result<(Sniff, BytesMut)> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        match parse_sni(&buf) {
            Sniff::Incomplete if buf.len() < max_bytes => {}
            Sniff::Incomplete => return Ok((Sniff::Malformed, buf)),
            verdict => return Ok((verdict, buf)),
        }
        buf.reserve(1024.min(max_bytes - buf.len()));
        let read = tokio::time::timeout_at(deadline, stream.read_buf(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out reading ClientHello"))??;
        if read == 0 {
            return Ok((Sniff::Incomplete, buf));
        }
    }
}
