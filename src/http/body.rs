//! Request body representation and the body spooler.
//!
//! A request body of declared length is read off the wire into a temporary
//! file so handlers can consume it without the server holding it in memory.
//! The spool file lives exactly as long as the [`Body`] value: dropping the
//! body (when the request slot is cleared between keep-alive requests, on
//! connection teardown, or on any error path) deletes the file.

use std::io;
use std::path::Path;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::server::wire::{WireError, WireStream};

/// A request body.
#[derive(Debug, Default)]
pub enum Body {
    /// No body was sent.
    #[default]
    Empty,
    /// A body held in memory.
    Inline(Bytes),
    /// A body spooled to a temporary file, deleted when the value drops.
    Spooled(NamedTempFile),
}

impl Body {
    /// Returns `true` for [`Body::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns the spool file path, if the body was spooled.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Spooled(file) => Some(file.path()),
            _ => None,
        }
    }

    /// Reads the body contents into memory.
    ///
    /// `Empty` yields an empty buffer; `Inline` is returned as-is; `Spooled`
    /// is read back from its file.
    pub async fn bytes(&self) -> io::Result<Bytes> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Inline(bytes) => Ok(bytes.clone()),
            Self::Spooled(file) => Ok(tokio::fs::read(file.path()).await?.into()),
        }
    }
}

/// Reads a body of `declared_len` bytes from the wire into a spool file in
/// `dir`.
///
/// Bodies no larger than `buf_size` are read in one piece and written out;
/// larger bodies are streamed in `buf_size`-sized chunks plus a final
/// remainder chunk. A zero-length body produces [`Body::Empty`] and touches
/// no file.
///
/// The caller has already enforced the size policy; this function only moves
/// bytes.
pub(crate) async fn spool<S>(
    wire: &mut WireStream<S>,
    declared_len: u64,
    buf_size: usize,
    dir: &Path,
) -> Result<Body, WireError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if declared_len == 0 {
        return Ok(Body::Empty);
    }

    let spool_file = tempfile::Builder::new()
        .prefix("swell-body-")
        .tempfile_in(dir)
        .map_err(WireError::Io)?;
    let mut out = tokio::fs::File::from_std(spool_file.reopen().map_err(WireError::Io)?);

    let buf_size = buf_size.max(1);
    if declared_len <= buf_size as u64 {
        let bytes = wire.read_exact(declared_len as usize).await?;
        out.write_all(&bytes).await.map_err(WireError::Io)?;
    } else {
        let mut remaining = declared_len;
        while remaining > 0 {
            let want = remaining.min(buf_size as u64) as usize;
            let chunk = wire.read_chunk(want).await?;
            out.write_all(&chunk).await.map_err(WireError::Io)?;
            remaining -= chunk.len() as u64;
        }
    }
    out.flush().await.map_err(WireError::Io)?;

    Ok(Body::Spooled(spool_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_body_reads_empty() {
        let body = Body::Empty;
        assert!(body.is_empty());
        assert!(body.path().is_none());
        assert!(body.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inline_body_round_trips() {
        let body = Body::Inline(Bytes::from_static(b"abc"));
        assert_eq!(&body.bytes().await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn spooled_file_deleted_on_drop() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"payload").unwrap();
        let path = file.path().to_path_buf();
        let body = Body::Spooled(file);
        assert_eq!(&body.bytes().await.unwrap()[..], b"payload");
        assert!(path.exists());
        drop(body);
        assert!(!path.exists());
    }

    async fn spool_input(input: Vec<u8>, buf_size: usize) -> Body {
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let len = input.len() as u64;
        let writer = tokio::spawn(async move {
            client.write_all(&input).await.unwrap();
        });
        let mut wire = WireStream::new(server, buf_size);
        let dir = std::env::temp_dir();
        let body = spool(&mut wire, len, buf_size, &dir).await.unwrap();
        writer.await.unwrap();
        body
    }

    #[tokio::test]
    async fn small_body_spooled_in_one_read() {
        let body = spool_input(b"abc".to_vec(), 1024).await;
        assert!(body.path().is_some());
        assert_eq!(&body.bytes().await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn large_body_streamed_in_chunks() {
        let input: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let body = spool_input(input.clone(), 1024).await;
        assert_eq!(&body.bytes().await.unwrap()[..], &input[..]);
    }

    #[tokio::test]
    async fn zero_length_body_is_empty() {
        let (_client, server) = tokio::io::duplex(64);
        let mut wire = WireStream::new(server, 64);
        let body = spool(&mut wire, 0, 1024, &std::env::temp_dir())
            .await
            .unwrap();
        assert!(body.is_empty());
    }
}
