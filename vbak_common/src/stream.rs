// vbak_common is the main vbak library implementing the backup engine logic.
// Copyright (C) 2026  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::system;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::{Key, XChaCha20Poly1305};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

/// The size of data chunks to compress or encrypt at a time in bytes (256 KiB).
pub const CHUNKSIZE: usize = 256 * 1024;

/// Archive format magic, the first bytes of every encrypted archive.
pub const MAGIC: [u8; 4] = *b"VBK1";

/// Size of the stream encryption nonce following the magic.
pub const NONCE_LEN: usize = 19;
/// Size of the per-chunk authentication tag.
pub const TAG_LEN: usize = 16;

/// The streaming compression algorithm applied before encryption.
/// The choice is recorded in the archive file name extension.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlgo {
    /// Zstandard.
    #[default]
    Zstd,
    /// DEFLATE in the gzip framing.
    Gzip,
}

impl CompressAlgo {
    /// Returns the file name extension recording this algorithm.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zstd => "zst",
            Self::Gzip => "gz",
        }
    }

    /// Returns the algorithm recorded by a file name extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "zst" => Some(Self::Zstd),
            "gz" => Some(Self::Gzip),
            _ => None,
        }
    }
}

impl fmt::Display for CompressAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A `CompressWriter` applies the configured streaming compression
/// to everything written to it, forwarding output to the inner [`Write`].
///
/// [`CompressWriter::finish`] is required to flush the compressor trailer.
pub enum CompressWriter<W: Write> {
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Gzip(GzEncoder<W>),
}

impl<W: Write> CompressWriter<W> {
    /// Constructs a new compressor in front of `inner`.
    pub fn new(algo: CompressAlgo, level: i32, inner: W) -> io::Result<Self> {
        match algo {
            CompressAlgo::Zstd => Ok(Self::Zstd(zstd::stream::write::Encoder::new(inner, level)?)),
            CompressAlgo::Gzip => Ok(Self::Gzip(GzEncoder::new(
                inner,
                Compression::new(level.clamp(0, 9) as u32),
            ))),
        }
    }

    /// Writes the compression trailer and returns the inner [`Write`].
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Zstd(encoder) => encoder.finish(),
            Self::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Zstd(encoder) => encoder.write(buf),
            Self::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Zstd(encoder) => encoder.flush(),
            Self::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// A `DecompressWriter` reverses a [`CompressWriter`],
/// forwarding decompressed output to the inner [`Write`].
pub enum DecompressWriter<W: Write> {
    Zstd(zstd::stream::write::Decoder<'static, W>),
    Gzip(GzDecoder<W>),
}

impl<W: Write> DecompressWriter<W> {
    /// Constructs a new decompressor in front of `inner`.
    pub fn new(algo: CompressAlgo, inner: W) -> io::Result<Self> {
        match algo {
            CompressAlgo::Zstd => Ok(Self::Zstd(zstd::stream::write::Decoder::new(inner)?)),
            CompressAlgo::Gzip => Ok(Self::Gzip(GzDecoder::new(inner))),
        }
    }

    /// Flushes any pending output and returns the inner [`Write`].
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Zstd(mut decoder) => {
                decoder.flush()?;
                Ok(decoder.into_inner())
            }
            Self::Gzip(decoder) => decoder.finish(),
        }
    }
}

impl<W: Write> Write for DecompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Zstd(decoder) => decoder.write(buf),
            Self::Gzip(decoder) => decoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Zstd(decoder) => decoder.flush(),
            Self::Gzip(decoder) => decoder.flush(),
        }
    }
}

/// An `EncryptWriter` maps everything written to it to the encrypted
/// archive format: the magic, a randomly generated nonce and a sequence
/// of authenticated ciphertext chunks.
///
/// [`EncryptWriter::finish`] is required to flush the final chunk;
/// without it the archive is truncated and will not decrypt.
pub struct EncryptWriter<W: Write> {
    inner: W,
    // The purpose of the `Option` is to allow `cipher` to be moved
    // when calling `encrypt_last` on it in `finish`.
    cipher: Option<EncryptorBE32<XChaCha20Poly1305>>,
    buf: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    /// Constructs a new `EncryptWriter`, deriving the stream key
    /// from the provided key material and writing the archive header.
    pub fn new(mut inner: W, key_material: &[u8]) -> io::Result<Self> {
        let nonce = system::random_bytes(NONCE_LEN);
        let key_bytes = system::derive_stream_key(key_material, &nonce);
        let key = Key::from_slice(&key_bytes);
        let cipher = EncryptorBE32::new(key, GenericArray::from_slice(&nonce));

        inner.write_all(&MAGIC)?;
        inner.write_all(&nonce)?;

        Ok(Self {
            inner,
            cipher: Some(cipher),
            buf: Vec::with_capacity(CHUNKSIZE),
        })
    }

    /// Encrypts and writes the final chunk, flushes the inner [`Write`]
    /// and returns it.
    pub fn finish(mut self) -> io::Result<W> {
        let ciphertext = self
            .cipher
            .take()
            .expect("cipher is only taken by finish")
            .encrypt_last(self.buf.as_slice())
            .map_err(io::Error::other)?;

        self.inner.write_all(&ciphertext)?;
        self.inner.flush()?;

        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);

        // Keep at least one byte buffered so the final chunk
        // is always sealed by `encrypt_last` in `finish`.
        while self.buf.len() > CHUNKSIZE {
            let chunk: Vec<u8> = self.buf.drain(..CHUNKSIZE).collect();
            let ciphertext = self
                .cipher
                .as_mut()
                .expect("cipher is only taken by finish")
                .encrypt_next(chunk.as_slice())
                .map_err(io::Error::other)?;

            self.inner.write_all(&ciphertext)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A `DecryptWriter` reverses an [`EncryptWriter`]: it consumes the magic
/// and nonce, then maps ciphertext chunks to plaintext
/// written to the inner [`Write`].
///
/// Dropping a `DecryptWriter` flushes the last chunk to the underlying
/// [`Write`] ignoring any errors. You should handle errors where applicable
/// by calling [`DecryptWriter::close`] manually before dropping the stream.
pub struct DecryptWriter<W: Write> {
    inner: W,
    key_material: Vec<u8>,
    closed: bool,
    // The purpose of the `Option` is to allow `cipher` to be moved
    // when calling `decrypt_last` on it with just a mutable reference
    // to the `DecryptWriter`.
    cipher: Option<DecryptorBE32<XChaCha20Poly1305>>,
    buf: VecDeque<u8>,
}

impl<W: Write> DecryptWriter<W> {
    /// Constructs a new `DecryptWriter` decrypting with the provided
    /// key material.
    pub fn new(inner: W, key_material: Vec<u8>) -> Self {
        Self {
            inner,
            key_material,
            closed: false,
            cipher: None,
            buf: VecDeque::with_capacity(TAG_LEN + CHUNKSIZE),
        }
    }

    /// Reports whether the `DecryptWriter` is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the `DecryptWriter`, decrypting the final chunk
    /// and writing all pending data to the underlying [`Write`].
    /// Fails with a 'broken pipe' error if already closed.
    ///
    /// Further writes will return 'broken pipe' errors.
    pub fn close(&mut self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        self.closed = true;

        self.buf.make_contiguous();

        // The final chunk includes the authentication tag.
        let mut chunk = vec![0; TAG_LEN + CHUNKSIZE];
        let n = self.buf.read(&mut chunk)?;
        chunk.truncate(n);

        if let Some(cipher) = self.cipher.take() {
            let plain = cipher
                .decrypt_last(chunk.as_slice())
                .map_err(io::Error::other)?;
            self.inner.write_all(&plain)?;
            self.inner.flush()?;
        } else if n > 0 {
            // Header never completed, the archive is truncated.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "archive ends inside the header",
            ));
        }

        Ok(())
    }
}

impl<W: Write> Write for DecryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        for byte in buf {
            if let Some(cipher) = &mut self.cipher {
                // Only drain a chunk once data beyond it has arrived,
                // the final chunk belongs to `close`.
                if self.buf.len() >= TAG_LEN + CHUNKSIZE {
                    let mut chunk = vec![0; TAG_LEN + CHUNKSIZE];
                    self.buf.read_exact(&mut chunk)?;

                    let plain = cipher
                        .decrypt_next(chunk.as_slice())
                        .map_err(io::Error::other)?;
                    self.inner.write_all(&plain)?;
                }
            } else if self.buf.len() >= MAGIC.len() + NONCE_LEN {
                let mut magic = [0; MAGIC.len()];
                self.buf.read_exact(&mut magic)?;

                if magic != MAGIC {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad archive magic",
                    ));
                }

                let mut nonce = [0; NONCE_LEN];
                self.buf.read_exact(&mut nonce)?;

                let key_bytes = system::derive_stream_key(&self.key_material, &nonce);
                let key = Key::from_slice(&key_bytes);
                self.cipher = Some(DecryptorBE32::new(key, GenericArray::from_slice(&nonce)));
            }

            self.buf.push_back(*byte);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write> Drop for DecryptWriter<W> {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::random_bytes;

    fn encrypt(data: &[u8], key: &[u8]) -> Vec<u8> {
        let mut w = EncryptWriter::new(Vec::new(), key).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    fn decrypt(data: &[u8], key: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut w = DecryptWriter::new(&mut out, key.to_vec());
        w.write_all(data)?;
        w.close()?;
        drop(w);
        Ok(out)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = random_bytes(32);

        for len in [0, 1, CHUNKSIZE - 1, CHUNKSIZE, CHUNKSIZE + 1, 3 * CHUNKSIZE] {
            let data = random_bytes(len);
            let ciphertext = encrypt(&data, &key);

            assert!(ciphertext.starts_with(&MAGIC));
            assert_eq!(decrypt(&ciphertext, &key).unwrap(), data);
        }
    }

    #[test]
    fn wrong_key_fails() {
        let data = random_bytes(1024);
        let ciphertext = encrypt(&data, &random_bytes(32));

        assert!(decrypt(&ciphertext, &random_bytes(32)).is_err());
    }

    #[test]
    fn bad_magic_fails() {
        let key = random_bytes(32);
        let mut ciphertext = encrypt(b"payload", &key);
        ciphertext[0] ^= 0xff;

        assert!(decrypt(&ciphertext, &key).is_err());
    }

    #[test]
    fn compress_roundtrip() {
        for algo in [CompressAlgo::Zstd, CompressAlgo::Gzip] {
            let data: Vec<u8> = (0..CHUNKSIZE * 2).map(|i| (i % 251) as u8).collect();

            let mut compressor = CompressWriter::new(algo, 3, Vec::new()).unwrap();
            compressor.write_all(&data).unwrap();
            let compressed = compressor.finish().unwrap();

            let mut decompressor = DecompressWriter::new(algo, Vec::new()).unwrap();
            decompressor.write_all(&compressed).unwrap();
            let out = decompressor.finish().unwrap();

            assert_eq!(out, data);
        }
    }

    #[test]
    fn extension_roundtrip() {
        for algo in [CompressAlgo::Zstd, CompressAlgo::Gzip] {
            assert_eq!(CompressAlgo::from_extension(algo.extension()), Some(algo));
        }
        assert_eq!(CompressAlgo::from_extension("xz"), None);
    }
}
