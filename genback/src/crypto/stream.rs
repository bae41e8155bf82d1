//! Streaming encrypt/decrypt over async readers and writers.

use super::{
    frame_nonce, CipherSuite, Header, FINAL_FLAG, FRAME_SIZE, HEADER_LEN, NONCE_PREFIX_LEN, TAG_LEN,
};
use crate::fs::BoxReader;
use crate::utils::errors::{EngineError, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Fill `buf` from `reader`, returning fewer bytes only at end of stream.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

struct FrameReader {
    blob: BoxReader,
    cipher: Aes256Gcm,
    header: [u8; HEADER_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    finished: bool,
}

impl FrameReader {
    async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        if let Err(e) = self.blob.read_exact(&mut len_buf).await {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::InvalidData, "encrypted blob is truncated")
            } else {
                e
            });
        }
        let raw = u32::from_be_bytes(len_buf);
        let last = raw & FINAL_FLAG != 0;
        let len = (raw & !FINAL_FLAG) as usize;
        if len < TAG_LEN || len > FRAME_SIZE + TAG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid encrypted frame length {}", len),
            ));
        }

        let mut sealed = vec![0u8; len];
        self.blob.read_exact(&mut sealed).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::InvalidData, "encrypted blob is truncated")
            } else {
                e
            }
        })?;

        let nonce = frame_nonce(&self.nonce_prefix, self.counter, last);
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &self.header,
                },
            )
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "encrypted frame failed authentication (wrong password or corrupted data)",
                )
            })?;

        self.counter = self.counter.wrapping_add(1);
        self.finished = last;
        Ok(Some(Bytes::from(plain)))
    }
}

impl CipherSuite {
    /// Encrypt (and optionally compress) `plain` into `out`. Returns the number of
    /// bytes written, which is the physical size of the blob.
    pub async fn encrypt<R, W>(
        &self,
        plain: R,
        out: &mut W,
        compress: bool,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let cipher = self.cipher_for(self.write_salt, self.params).await?;

        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut nonce_prefix);
        let header = Header {
            compressed: compress,
            params: self.params,
            salt: self.write_salt,
            nonce_prefix,
        }
        .to_bytes();

        out.write_all(&header).await?;
        let mut written = HEADER_LEN as u64;

        let mut source: Pin<Box<dyn AsyncRead + Send>> = if compress {
            Box::pin(ZstdEncoder::new(BufReader::new(plain)))
        } else {
            Box::pin(plain)
        };

        let mut chunk = vec![0u8; FRAME_SIZE];
        let mut counter: u32 = 0;
        loop {
            let n = tokio::select! {
                r = read_full(&mut source, &mut chunk) => r?,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            };
            let last = n < FRAME_SIZE;
            let nonce = frame_nonce(&nonce_prefix, counter, last);
            let sealed = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &chunk[..n],
                        aad: &header,
                    },
                )
                .map_err(|_| EngineError::Crypto("frame encryption failed".into()))?;

            let mut len = sealed.len() as u32;
            if last {
                len |= FINAL_FLAG;
            }
            out.write_all(&len.to_be_bytes()).await?;
            out.write_all(&sealed).await?;
            written += 4 + sealed.len() as u64;

            if last {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| EngineError::Crypto("file too large for one blob".into()))?;
        }

        out.flush().await?;
        Ok(written)
    }

    /// Wrap an encrypted blob so that reading it yields the original plaintext.
    pub async fn decrypt_reader(&self, mut blob: BoxReader) -> Result<BoxReader> {
        let mut header_bytes = [0u8; HEADER_LEN];
        blob.read_exact(&mut header_bytes).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                EngineError::Crypto("blob is shorter than the encryption header".into())
            } else {
                EngineError::Io(e)
            }
        })?;
        let header = Header::parse(&header_bytes)?;
        let cipher = self.cipher_for(header.salt, header.params).await?;

        let frames = FrameReader {
            blob,
            cipher,
            header: header_bytes,
            nonce_prefix: header.nonce_prefix,
            counter: 0,
            finished: false,
        };
        let stream = futures_util::stream::try_unfold(frames, |mut frames| async move {
            Ok::<_, io::Error>(frames.next_frame().await?.map(|chunk| (chunk, frames)))
        });
        let reader = StreamReader::new(Box::pin(stream));

        if header.compressed {
            Ok(Box::new(ZstdDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::KdfParams;
    use super::*;
    use std::io::Cursor;

    fn suite(password: &str) -> CipherSuite {
        CipherSuite::new(
            password,
            KdfParams {
                memory_kib: 64,
                iterations: 1,
            },
        )
        .unwrap()
    }

    async fn seal(suite: &CipherSuite, plain: Vec<u8>, compress: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let written = suite
            .encrypt(Cursor::new(plain), &mut out, compress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written as usize, out.len());
        out
    }

    async fn open(suite: &CipherSuite, blob: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut reader = suite
            .decrypt_reader(Box::new(Cursor::new(blob)))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).await?;
        Ok(plain)
    }

    #[tokio::test]
    async fn test_round_trip_multi_frame() {
        let suite = suite("correct horse");
        let plain: Vec<u8> = (0..(FRAME_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect();
        let blob = seal(&suite, plain.clone(), false).await;
        assert_eq!(open(&suite, blob).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_round_trip_exact_frame_multiple_and_empty() {
        let suite = suite("pw");
        let plain = vec![42u8; FRAME_SIZE];
        let blob = seal(&suite, plain.clone(), false).await;
        assert_eq!(open(&suite, blob).await.unwrap(), plain);

        let blob = seal(&suite, Vec::new(), false).await;
        assert!(open(&suite, blob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compression_shrinks_repetitive_content() {
        let suite = suite("pw");
        let plain = vec![b'A'; 200_000];
        let blob = seal(&suite, plain.clone(), true).await;
        assert!(blob.len() < plain.len() / 10);
        assert_eq!(open(&suite, blob).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let suite = suite("pw");
        let mut blob = seal(&suite, b"sensitive payload".to_vec(), false).await;
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(open(&suite, blob).await.is_err());
    }

    #[tokio::test]
    async fn test_truncation_is_detected() {
        let suite = suite("pw");
        let plain = vec![1u8; FRAME_SIZE + 10];
        let blob = seal(&suite, plain, false).await;
        let cut = HEADER_LEN + 4 + FRAME_SIZE + TAG_LEN;
        assert!(open(&suite, blob[..cut].to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_password_fails() {
        let blob = seal(&suite("right"), b"data".to_vec(), false).await;
        assert!(open(&suite("wrong"), blob).await.is_err());
    }
}
