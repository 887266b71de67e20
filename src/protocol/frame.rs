// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Wire encoding for the repeated per-message frame that follows the connection preamble:
//! `(id, timestamp, verb ordinal, parameter count, parameters…, payload)`, all big-endian,
//! length-prefixed where variable-sized. Every field is read in order regardless of whether a
//! handler or callback ends up consuming the payload, which is what lets the id lookup for
//! `REQUEST_RESPONSE`/`INTERNAL_RESPONSE` happen *before* the payload bytes are touched: an
//! unknown id just means the already-read-and-discarded payload bytes are dropped, never a parse
//! error.

use std::convert::TryFrom;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::FrameError,
    message::{MessageId, Parameters},
    verb::Verb,
};

/// A frame as read directly off the wire, before the hub resolves how its payload should be
/// interpreted.
pub struct RawFrame {
    pub id: MessageId,
    pub timestamp_millis: u32,
    pub verb: Verb,
    pub parameters: Parameters,
    pub payload: Bytes,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: MessageId,
    timestamp_millis: u32,
    verb: Verb,
    parameters: &Parameters,
    payload: &[u8],
) -> Result<(), FrameError> {
    writer.write_u32(id as u32).await?;
    writer.write_u32(timestamp_millis).await?;
    writer.write_u32(verb.ordinal()).await?;
    writer.write_u32(parameters.len() as u32).await?;
    for (key, value) in parameters {
        write_string(writer, key).await?;
        write_bytes(writer, value).await?;
    }
    write_bytes(writer, payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RawFrame, FrameError> {
    let id = reader.read_u32().await.map_err(|_| FrameError::Truncated("id"))? as MessageId;
    let timestamp_millis = reader.read_u32().await.map_err(|_| FrameError::Truncated("timestamp"))?;
    let verb_ordinal = reader.read_u32().await.map_err(|_| FrameError::Truncated("verb"))?;
    let verb = Verb::try_from(verb_ordinal)?;
    let param_count = reader.read_u32().await.map_err(|_| FrameError::Truncated("parameter count"))?;

    let mut parameters = Parameters::new();
    for _ in 0..param_count {
        let key = read_string(reader).await?;
        let value = read_bytes(reader).await?;
        parameters.insert(key, value);
    }

    let payload = read_bytes(reader).await?;

    Ok(RawFrame {
        id,
        timestamp_millis,
        verb,
        parameters,
        payload,
    })
}

async fn write_bytes<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), FrameError> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, FrameError> {
    let len = reader.read_u32().await.map_err(|_| FrameError::Truncated("length prefix"))? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|_| FrameError::Truncated("length-prefixed body"))?;
    Ok(Bytes::from(buf))
}

async fn write_string<W: AsyncWrite + Unpin>(writer: &mut W, s: &str) -> Result<(), FrameError> {
    write_bytes(writer, s.as_bytes()).await
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, FrameError> {
    let bytes = read_bytes(reader).await?;
    String::from_utf8(bytes.to_vec()).map_err(|e| FrameError::PayloadDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn frame_round_trips_with_parameters() {
        let mut params = Parameters::new();
        params.insert("CAL_BAC".to_string(), Bytes::from_static(b"1"));

        let mut buf = Vec::new();
        write_frame(&mut buf, 42, 1_000, Verb::Echo, &params, b"hello").await.unwrap();

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.id, 42);
        assert_eq!(frame.timestamp_millis, 1_000);
        assert_eq!(frame.verb, Verb::Echo);
        assert_eq!(frame.parameters.get("CAL_BAC").unwrap(), &Bytes::from_static(b"1"));
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[tokio::test]
    async fn unknown_verb_ordinal_is_rejected_before_payload_is_touched() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes()); // id
        buf.extend_from_slice(&0u32.to_be_bytes()); // timestamp
        buf.extend_from_slice(&99u32.to_be_bytes()); // bogus verb ordinal
        buf.extend_from_slice(&0u32.to_be_bytes()); // parameter count

        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownVerb(99)));
    }
}
