//! Host ↔ worker wire protocol.
//!
//! One request and one reply message, length-prefix framed:
//!
//! ```text
//! [len: u32 LE][payload: len bytes]
//! ```
//!
//! Payloads are [`Encode`]-serialized structs. Job byte fields travel as
//! lowercase hex strings, which keeps the messages printable in logs and
//! makes the framing trivially size-bounded.

use crate::types::bytes::Bytes;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::types::hash::TxHash;
use crate::vm::machine::{Job, JobError};
use duelchain_derive::Error;
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on one frame. The largest legal request is two hex-encoded
/// 8 KiB scripts plus a hash, well under this.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Errors turning a request back into a runnable job.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A job field was not valid hex.
    #[error("{field} is not valid hex")]
    BadHex { field: &'static str },
    /// The hash field did not decode to exactly 32 bytes.
    #[error("hash must be 32 hex-encoded bytes")]
    BadHash,
    /// A script image exceeded the job bounds.
    #[error("{0}")]
    Job(JobError),
}

/// A verification request: one job, hex-encoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifyRequest {
    pub hash: String,
    pub output: String,
    pub input: String,
}

impl VerifyRequest {
    /// Encodes a job for the wire.
    pub fn from_job(job: &Job) -> VerifyRequest {
        VerifyRequest {
            hash: job.hash.to_string(),
            output: job.output.to_hex(),
            input: job.input.to_hex(),
        }
    }

    /// Decodes and bound-checks the carried job.
    pub fn to_job(&self) -> Result<Job, ProtocolError> {
        let hash = TxHash::from_hex(&self.hash).ok_or(ProtocolError::BadHash)?;
        let output =
            Bytes::from_hex(&self.output).map_err(|_| ProtocolError::BadHex { field: "output" })?;
        let input =
            Bytes::from_hex(&self.input).map_err(|_| ProtocolError::BadHex { field: "input" })?;
        Job::new(hash, output, input).map_err(ProtocolError::Job)
    }
}

impl Encode for VerifyRequest {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.hash.encode(out);
        self.output.encode(out);
        self.input.encode(out);
    }
}

impl Decode for VerifyRequest {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(VerifyRequest {
            hash: String::decode(input)?,
            output: String::decode(input)?,
            input: String::decode(input)?,
        })
    }
}

/// A worker's answer to one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifyReply {
    /// The verdict. Always false when `error` is set.
    pub result: bool,
    /// Present when the worker could not run the job as given.
    pub error: Option<String>,
}

impl VerifyReply {
    /// A clean verdict.
    pub fn verdict(result: bool) -> VerifyReply {
        VerifyReply { result, error: None }
    }

    /// A failed evaluation: verdict false plus a reason.
    pub fn fail(error: impl Into<String>) -> VerifyReply {
        VerifyReply {
            result: false,
            error: Some(error.into()),
        }
    }
}

impl Encode for VerifyReply {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.result.encode(out);
        self.error.encode(out);
    }
}

impl Decode for VerifyReply {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(VerifyReply {
            result: bool::decode(input)?,
            error: Option::<String>::decode(input)?,
        })
    }
}

fn frame_len(len_buf: [u8; 4]) -> io::Result<usize> {
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes outside 1..={MAX_FRAME_BYTES}"),
        ));
    }
    Ok(len)
}

/// Writes one length-prefixed frame.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one length-prefixed frame. Returns `None` on a clean EOF at a
/// frame boundary.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut payload = vec![0u8; frame_len(len_buf)?];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Async variant of [`write_frame`] for the host side of the pipe.
pub async fn write_frame_async(
    writer: &mut (impl AsyncWrite + Unpin),
    payload: &[u8],
) -> io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Async variant of [`read_frame`].
pub async fn read_frame_async(
    reader: &mut (impl AsyncRead + Unpin),
) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut payload = vec![0u8; frame_len(len_buf)?];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::machine::MAX_SCRIPT_BYTES;

    fn sample_job() -> Job {
        Job::new(TxHash([0xAB; 32]), vec![0xE0, 0x01], vec![0x12, 0x34]).unwrap()
    }

    #[test]
    fn request_roundtrip() {
        let request = VerifyRequest::from_job(&sample_job());
        let decoded = VerifyRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(decoded, request);

        let job = decoded.to_job().unwrap();
        assert_eq!(job.hash, TxHash([0xAB; 32]));
        assert_eq!(job.output.as_slice(), &[0xE0, 0x01]);
        assert_eq!(job.input.as_slice(), &[0x12, 0x34]);
    }

    #[test]
    fn reply_roundtrip() {
        for reply in [
            VerifyReply::verdict(true),
            VerifyReply::verdict(false),
            VerifyReply::fail("boom"),
        ] {
            assert_eq!(VerifyReply::from_bytes(&reply.to_bytes()).unwrap(), reply);
        }
    }

    #[test]
    fn request_with_bad_hash_is_rejected() {
        let request = VerifyRequest {
            hash: "abcd".to_string(),
            output: String::new(),
            input: String::new(),
        };
        assert!(matches!(request.to_job(), Err(ProtocolError::BadHash)));
    }

    #[test]
    fn request_with_junk_hex_is_rejected() {
        let request = VerifyRequest {
            hash: "00".repeat(32),
            output: "zz".to_string(),
            input: String::new(),
        };
        assert!(matches!(
            request.to_job(),
            Err(ProtocolError::BadHex { field: "output" })
        ));
    }

    #[test]
    fn request_with_oversized_script_is_rejected() {
        let request = VerifyRequest {
            hash: "00".repeat(32),
            output: "00".repeat(MAX_SCRIPT_BYTES + 1),
            input: String::new(),
        };
        assert!(matches!(request.to_job(), Err(ProtocolError::Job(_))));
    }

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"world").unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"world");
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        buf.truncate(buf.len() - 2);
        let mut reader = buf.as_slice();
        assert!(read_frame(&mut reader).is_err());
    }

    #[test]
    fn oversized_frame_header_is_rejected() {
        let mut buf = ((MAX_FRAME_BYTES as u32) + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        let mut reader = buf.as_slice();
        assert!(read_frame(&mut reader).is_err());
    }

    #[tokio::test]
    async fn async_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame_async(&mut buf, b"ping").await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(read_frame_async(&mut reader).await.unwrap().unwrap(), b"ping");
        assert!(read_frame_async(&mut reader).await.unwrap().is_none());
    }
}
