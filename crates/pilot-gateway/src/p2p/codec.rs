// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON codec for the libp2p `request_response` protocol.
//!
//! Wire format per message:
//!   [4 bytes big-endian length][JSON-encoded payload]
//!
//! The payload schema is identical to the HTTP body, so one data-channel
//! message per request mirrors `POST /responses` exactly.
//! Max message size: 16 MiB (requests may embed screenshots).

use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};

use crate::{ResponsesReply, ResponsesRequest};

const MAX_MSG_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

pub const RESPONSES_PROTO: StreamProtocol = StreamProtocol::new("/pilot/responses/1.0.0");

async fn write_framed<W, T>(io: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: serde::Serialize,
{
    let payload = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if payload.len() > MAX_MSG_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    let len = payload.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&payload).await?;
    io.close().await
}

async fn read_framed<R, T>(io: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin + Send,
    T: for<'de> serde::Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MSG_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "incoming message too large"));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// libp2p `request_response::Codec` exchanging length-framed JSON
/// `ResponsesRequest` / `ResponsesReply` messages.
#[derive(Clone, Default, Debug)]
pub struct JsonCodec;

#[async_trait]
impl request_response::Codec for JsonCodec {
    type Protocol = StreamProtocol;
    type Request = ResponsesRequest;
    type Response = ResponsesReply;

    async fn read_request<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<ResponsesRequest>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn read_response<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<ResponsesReply>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn write_request<T>(
        &mut self,
        _proto: &StreamProtocol,
        io: &mut T,
        req: ResponsesRequest,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _proto: &StreamProtocol,
        io: &mut T,
        resp: ResponsesReply,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &resp).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
