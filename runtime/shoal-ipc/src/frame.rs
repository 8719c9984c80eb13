//! Length-prefixed frames shared by the call channel and the control link.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireCodec {
    #[default]
    Json,
    Msgpack,
}

impl WireCodec {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, FrameError> {
        match self {
            WireCodec::Json => {
                serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))
            }
            WireCodec::Msgpack => {
                rmp_serde::to_vec_named(value).map_err(|err| FrameError::Encode(err.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, FrameError> {
        match self {
            WireCodec::Json => {
                serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
            }
            WireCodec::Msgpack => {
                rmp_serde::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
            }
        }
    }
}

impl FromStr for WireCodec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(WireCodec::Json),
            "msgpack" => Ok(WireCodec::Msgpack),
            other => Err(format!("Unsupported wire codec '{other}'")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds max size")]
    TooLarge(usize),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Reads one frame. A clean EOF before the header yields `Ok(None)`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err.into());
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(size));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let size = payload.len() as u32;
    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<T, R>(reader: &mut R, codec: WireCodec) -> Result<Option<T>, FrameError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(bytes) => codec.decode(&bytes).map(Some),
        None => Ok(None),
    }
}

pub async fn write_message<T, W>(writer: &mut W, codec: WireCodec, value: &T) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let encoded = codec.encode(value)?;
    write_frame(writer, &encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut left, mut right) = tokio::io::duplex(1024);
        write_frame(&mut left, b"hello").await.expect("write");
        write_frame(&mut left, b"").await.expect("write empty");
        drop(left);
        assert_eq!(read_frame(&mut right).await.expect("read"), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut right).await.expect("read"), Some(Vec::new()));
        assert_eq!(read_frame(&mut right).await.expect("eof"), None);
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let (mut left, mut right) = tokio::io::duplex(64);
        let size = (MAX_FRAME_SIZE as u32) + 1;
        left.write_all(&size.to_le_bytes()).await.expect("header");
        let err = read_frame(&mut right).await.expect_err("too large");
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[test]
    fn codec_names_parse() {
        assert_eq!("json".parse::<WireCodec>(), Ok(WireCodec::Json));
        assert_eq!(" MsgPack ".parse::<WireCodec>(), Ok(WireCodec::Msgpack));
        assert!("cbor".parse::<WireCodec>().is_err());
    }
}
