//! Length-prefixed framing over an overlay byte stream.
//!
//! Every frame is a 4-byte big-endian unsigned length followed by the
//! payload, so a reader can always skip a payload it cannot parse without
//! losing frame alignment. Compression is positional: both ends know from
//! the protocol step whether a given frame's payload is zlib-compressed,
//! nothing is flagged in-band.

use std::io::Read;

use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};

use veilroom_shared::constants::MAX_FRAME_SIZE;

use crate::error::NetError;

pub struct FramedConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> FramedConnection<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        }
    }

    /// Read one frame. `compressed` must mirror what the writer used for
    /// this protocol step.
    pub async fn read_bytes(&mut self, compressed: bool) -> Result<Vec<u8>, NetError> {
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(NetError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;

        if compressed {
            payload = decompress(&payload)?;
        }
        Ok(payload)
    }

    /// Write one frame, optionally zlib-compressing the payload first.
    /// Buffered; call [`flush`](Self::flush) before expecting a reply.
    pub async fn write_bytes(&mut self, data: &[u8], compress: bool) -> Result<(), NetError> {
        let payload = if compress {
            let mut encoder = ZlibEncoder::new(data, Compression::default());
            let mut out = Vec::new();
            encoder.read_to_end(&mut out)?;
            out
        } else {
            data.to_vec()
        };

        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(&payload).await?;
        Ok(())
    }

    pub async fn read_string(&mut self) -> Result<String, NetError> {
        let bytes = self.read_bytes(false).await?;
        String::from_utf8(bytes).map_err(|_| NetError::InvalidUtf8)
    }

    pub async fn write_string(&mut self, s: &str) -> Result<(), NetError> {
        self.write_bytes(s.as_bytes(), false).await
    }

    /// A 4-byte big-endian signed integer, framed like everything else.
    pub async fn read_int(&mut self) -> Result<i32, NetError> {
        let bytes = self.read_bytes(false).await?;
        let arr: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetError::InvalidIntFrame(bytes.len()))?;
        Ok(i32::from_be_bytes(arr))
    }

    pub async fn write_int(&mut self, v: i32) -> Result<(), NetError> {
        self.write_bytes(&v.to_be_bytes(), false).await
    }

    /// Deserialize a framed JSON value.
    pub async fn read_struct<T: DeserializeOwned>(
        &mut self,
        compressed: bool,
    ) -> Result<T, NetError> {
        let bytes = self.read_bytes(compressed).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Serialize a value as JSON and frame it.
    pub async fn write_struct<T: Serialize>(
        &mut self,
        value: &T,
        compress: bool,
    ) -> Result<(), NetError> {
        let bytes = serde_json::to_vec(value)?;
        self.write_bytes(&bytes, compress).await
    }

    pub async fn flush(&mut self) -> Result<(), NetError> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and shut the write side down.
    pub async fn close(&mut self) -> Result<(), NetError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, NetError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| NetError::Decompress(e.to_string()))?;
    if out.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            size: out.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(out)
}
