// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers.

Package payloads are addressed by their SHA-512 digest. This module
provides the digest type plus [futures::io::AsyncRead] adapters that
compute or enforce digests while content streams through, and a helper
for spooling an async stream to a seekable temporary file.
*/

use {
    crate::error::{ClusterPackagingError, Result},
    futures::{AsyncRead, AsyncReadExt},
    pin_project::pin_project,
    sha2::{Digest, Sha512},
    std::{
        fmt::Formatter,
        io::{Seek, SeekFrom, Write},
        pin::Pin,
        task::{Context, Poll},
    },
};

/// A reader for package payloads.
pub type PackageStream = Pin<Box<dyn AsyncRead + Send>>;

/// A SHA-512 content digest.
#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ContentDigest(Vec<u8>);

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha512({})", hex::encode(&self.0))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl ContentDigest {
    /// Obtain an instance by parsing a hex digest string.
    pub fn from_hex(digest: &str) -> Result<Self> {
        let digest = hex::decode(digest)?;

        if digest.len() != 64 {
            return Err(ClusterPackagingError::BadParameter(format!(
                "SHA-512 digest must be 64 bytes; got {}",
                digest.len()
            )));
        }

        Ok(Self(digest))
    }

    /// Compute the digest of a byte slice.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data.as_ref());

        Self(hasher.finalize().to_vec())
    }

    /// Obtain the raw digest bytes.
    pub fn digest_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Obtain the hex encoded digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Incrementally computes a [ContentDigest] from written content.
pub struct Digester {
    hasher: Sha512,
    bytes_written: u64,
}

impl Default for Digester {
    fn default() -> Self {
        Self {
            hasher: Sha512::new(),
            bytes_written: 0,
        }
    }
}

impl Digester {
    /// Write content into the digester.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
    }

    /// Finish digesting, returning the digest and the byte count seen.
    pub fn finish(self) -> (ContentDigest, u64) {
        (
            ContentDigest(self.hasher.finalize().to_vec()),
            self.bytes_written,
        )
    }
}

/// An [AsyncRead] adapter that computes a [ContentDigest] as data is read.
#[pin_project]
pub struct DigestingReader<R> {
    digester: Digester,
    #[pin]
    source: R,
}

impl<R> DigestingReader<R> {
    /// Construct a new instance from a source reader.
    pub fn new(source: R) -> Self {
        Self {
            digester: Digester::default(),
            source,
        }
    }

    /// Finish the stream.
    ///
    /// Returns the source reader, the resolved digest, and the total
    /// number of bytes read.
    pub fn finish(self) -> (R, ContentDigest, u64) {
        let (digest, size) = self.digester.finish();

        (self.source, digest, size)
    }
}

impl<R> AsyncRead for DigestingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut this = self.project();

        match this.source.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(size)) => {
                if size > 0 {
                    this.digester.update(&buf[0..size]);
                }

                Poll::Ready(Ok(size))
            }
            res => res,
        }
    }
}

/// An [AsyncRead] adapter that validates source size and digest.
///
/// Validation only occurs once the expected number of bytes has been
/// read. Readers must therefore drain this stream to completion or
/// incorrect content could go undetected.
#[pin_project]
pub struct ContentValidatingReader<R> {
    hasher: Option<Digester>,
    expected_size: u64,
    expected_digest: ContentDigest,
    #[pin]
    source: R,
    bytes_read: u64,
}

impl<R> ContentValidatingReader<R> {
    /// Create a new instance bound to a source with expected size and digest.
    pub fn new(source: R, expected_size: u64, expected_digest: ContentDigest) -> Self {
        Self {
            hasher: Some(Digester::default()),
            expected_size,
            expected_digest,
            source,
            bytes_read: 0,
        }
    }
}

impl<R> AsyncRead for ContentValidatingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut this = self.project();

        match this.source.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(size)) => {
                if size > 0 {
                    if let Some(hasher) = this.hasher.as_mut() {
                        hasher.update(&buf[0..size]);
                    }

                    *this.bytes_read += size as u64;
                }

                match (*this.bytes_read).cmp(&*this.expected_size) {
                    std::cmp::Ordering::Equal => {
                        if let Some(hasher) = this.hasher.take() {
                            let (got_digest, _) = hasher.finish();

                            if got_digest.digest_bytes() != this.expected_digest.digest_bytes() {
                                return Poll::Ready(Err(std::io::Error::new(
                                    std::io::ErrorKind::Other,
                                    format!(
                                        "digest mismatch of retrieved content: expected {}, got {}",
                                        this.expected_digest, got_digest
                                    ),
                                )));
                            }
                        }
                    }
                    std::cmp::Ordering::Greater => {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!(
                                "extra bytes read: expected {}; got {}",
                                this.expected_size, this.bytes_read
                            ),
                        )));
                    }
                    std::cmp::Ordering::Less => {}
                }

                Poll::Ready(Ok(size))
            }
            res => res,
        }
    }
}

/// Spool an async stream to an anonymous temporary file.
///
/// The returned file is unlinked from the filesystem and positioned at
/// the start of the content, ready for synchronous consumers such as
/// archive readers.
pub async fn spool_to_temp_file(mut reader: PackageStream) -> Result<std::fs::File> {
    let mut file = tempfile::tempfile()?;

    let mut buf = [0u8; 32768];

    loop {
        let count = reader.read(&mut buf).await?;
        if count == 0 {
            break;
        }

        file.write_all(&buf[0..count])?;
    }

    file.seek(SeekFrom::Start(0))?;

    Ok(file)
}

/// Read an entire async stream into memory.
pub async fn read_stream_to_vec(mut reader: PackageStream) -> Result<Vec<u8>> {
    let mut data = vec![];
    reader.read_to_end(&mut data).await?;

    Ok(data)
}
