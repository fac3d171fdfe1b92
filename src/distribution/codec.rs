use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::config::Compression;
use crate::error::{Error, Result};
use crate::hash::{ContentHasher, Digest};

pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_LAYER_XZ: &str = "application/vnd.oci.image.layer.v1.tar+xz";

const GZIP_DEFAULT_LEVEL: u32 = 6;
const XZ_DEFAULT_LEVEL: u32 = 6;

/// layer media type written for `compression`
pub fn media_type(compression: Compression) -> &'static str {
    match compression {
        Compression::Gzip => MEDIA_TYPE_LAYER_GZIP,
        Compression::Zstd => MEDIA_TYPE_LAYER_ZSTD,
        Compression::Xz => MEDIA_TYPE_LAYER_XZ,
    }
}

/// compression named by a layer media type
///
/// anything else, including uncompressed layers, is refused rather than
/// guessed at.
pub fn compression_for(media_type: &str) -> Result<Compression> {
    match media_type {
        MEDIA_TYPE_LAYER_GZIP => Ok(Compression::Gzip),
        MEDIA_TYPE_LAYER_ZSTD => Ok(Compression::Zstd),
        MEDIA_TYPE_LAYER_XZ => Ok(Compression::Xz),
        other => Err(Error::UnsupportedCompression(other.to_string())),
    }
}

/// compress everything `input` yields into `output`, returning `output`
pub(crate) fn compress<R: Read, W: Write>(
    compression: Compression,
    level: Option<u32>,
    mut input: R,
    output: W,
) -> io::Result<W> {
    match compression {
        Compression::Gzip => {
            let level = level.unwrap_or(GZIP_DEFAULT_LEVEL).min(9);
            let mut encoder = GzEncoder::new(output, flate2::Compression::new(level));
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()
        }
        Compression::Zstd => {
            let level = level
                .map(|l| l.min(22) as i32)
                .unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL);
            let mut encoder = zstd::Encoder::new(output, level)?;
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()
        }
        Compression::Xz => {
            let level = level.unwrap_or(XZ_DEFAULT_LEVEL).min(9);
            let mut encoder = XzEncoder::new(output, level);
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()
        }
    }
}

/// reader yielding the decompressed bytes of `input`
pub(crate) fn decompressor<'a, R: Read + 'a>(
    compression: Compression,
    input: R,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(input)),
        Compression::Zstd => Box::new(zstd::Decoder::new(input)?),
        Compression::Xz => Box::new(XzDecoder::new(input)),
    })
}

/// reader adapter hashing every byte read through it
pub(crate) struct DigestReader<R> {
    inner: R,
    hasher: ContentHasher,
}

impl<R: Read> DigestReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: ContentHasher::new(),
        }
    }

    /// digest and length of what was read
    pub(crate) fn finish(self) -> (Digest, u64) {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
