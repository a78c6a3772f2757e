// dbstream/src/pipeline/transform.rs
use std::io::{self, Write};

use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};

/// A streaming byte converter sitting between producer and consumer.
pub trait Transform: Send {
    /// Feeds one chunk and returns whatever output is ready.
    fn push(&mut self, input: &[u8]) -> io::Result<Vec<u8>>;

    /// Flushes the remaining output once the producer is exhausted.
    fn finish(&mut self) -> io::Result<Vec<u8>>;
}

/// Plain gzip, no extra header fields.
pub struct GzipCompress {
    encoder: GzEncoder<Vec<u8>>,
}

impl GzipCompress {
    pub fn new() -> Self {
        GzipCompress {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }
}

impl Default for GzipCompress {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for GzipCompress {
    fn push(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        self.encoder.write_all(input)?;
        Ok(std::mem::take(self.encoder.get_mut()))
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        self.encoder.try_finish()?;
        Ok(std::mem::take(self.encoder.get_mut()))
    }
}

pub struct GzipDecompress {
    decoder: GzDecoder<Vec<u8>>,
}

impl GzipDecompress {
    pub fn new() -> Self {
        GzipDecompress {
            decoder: GzDecoder::new(Vec::new()),
        }
    }
}

impl Default for GzipDecompress {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for GzipDecompress {
    fn push(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        self.decoder.write_all(input)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    // Fails on a truncated stream: the gzip trailer must have been seen.
    fn finish(&mut self) -> io::Result<Vec<u8>> {
        self.decoder.try_finish()?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }
}

#[cfg(test)]
pub(crate) fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut compress = GzipCompress::new();
    let mut out = compress.push(bytes).unwrap();
    out.extend(compress.finish().unwrap());
    out
}
