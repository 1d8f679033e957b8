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

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::reverse::Error;

const TYPE_HELLO: u8 = 1;
const TYPE_ACCEPT: u8 = 2;
const TYPE_REJECT: u8 = 3;
const TYPE_PACKET: u8 = 4;
const TYPE_KEEPALIVE: u8 = 5;

/// Largest frame body: a maximum size IP packet plus the type byte.
pub const MAX_FRAME_LEN: usize = 65535 + 1;

/// Sent by the client to open a link, claiming the tenant's address ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub tenant: String,
    pub ranges: Vec<IpNet>,
}

/// The server's answer to an acceptable hello, with its own ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    pub ranges: Vec<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reject {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Accept(Accept),
    Reject(Reject),
    /// One raw IP packet.
    Packet(Bytes),
    Keepalive,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Accept(_) => "accept",
            Frame::Reject(_) => "reject",
            Frame::Packet(_) => "packet",
            Frame::Keepalive => "keepalive",
        }
    }
}

/// FrameCodec frames the link: a 4 byte length, a type byte, then the body. Control frames carry
/// JSON.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::Frame(e.to_string()))
}

fn control<T: Serialize>(body: &mut BytesMut, kind: u8, value: &T) -> Result<(), Error> {
    let value = serde_json::to_vec(value).map_err(|e| Error::Frame(e.to_string()))?;
    body.put_u8(kind);
    body.extend_from_slice(&value);
    Ok(())
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if body.is_empty() {
            return Err(Error::Frame("empty frame".to_string()));
        }
        let frame = match body.get_u8() {
            TYPE_HELLO => Frame::Hello(json(&body)?),
            TYPE_ACCEPT => Frame::Accept(json(&body)?),
            TYPE_REJECT => Frame::Reject(json(&body)?),
            TYPE_PACKET => Frame::Packet(body.freeze()),
            TYPE_KEEPALIVE => Frame::Keepalive,
            other => return Err(Error::Frame(format!("unknown frame type {other}"))),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        match frame {
            Frame::Hello(h) => control(&mut body, TYPE_HELLO, &h)?,
            Frame::Accept(a) => control(&mut body, TYPE_ACCEPT, &a)?,
            Frame::Reject(r) => control(&mut body, TYPE_REJECT, &r)?,
            Frame::Packet(p) => {
                body.put_u8(TYPE_PACKET);
                body.extend_from_slice(&p);
            }
            Frame::Keepalive => body.put_u8(TYPE_KEEPALIVE),
        }
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}
