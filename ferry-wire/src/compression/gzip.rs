use std::io::Write;

use flate2::{
    write::{GzDecoder, GzEncoder},
    Compression,
};

use super::{CodecStatus, CompressError, CompressionMethod, Direction, Progress, StreamCodec, Totals};

enum Inner {
    Encoder(GzEncoder<Vec<u8>>),
    Decoder(GzDecoder<Vec<u8>>, Totals),
}

/// A gzip codec. `flate2`'s writers collect their output in a `Vec`, which is handed out to
/// the caller as room allows.
pub struct GzipCodec {
    inner: Inner,
    /// Set once the stream trailer has been handled.
    finished: bool,
}

impl std::fmt::Debug for GzipCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipCodec")
            .field("direction", &self.direction())
            .field("pending", &self.pending().len())
            .finish()
    }
}

impl GzipCodec {
    /// Creates a gzip compressor with the given level (0-9).
    pub fn compressor(level: u32) -> Self {
        Self {
            inner: Inner::Encoder(GzEncoder::new(Vec::new(), Compression::new(level.min(9)))),
            finished: false,
        }
    }

    pub fn decompressor() -> Self {
        Self { inner: Inner::Decoder(GzDecoder::new(Vec::new()), Totals::default()), finished: false }
    }

    fn pending(&self) -> &Vec<u8> {
        match &self.inner {
            Inner::Encoder(enc) => enc.get_ref(),
            Inner::Decoder(dec, _) => dec.get_ref(),
        }
    }

    fn pending_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.inner {
            Inner::Encoder(enc) => enc.get_mut(),
            Inner::Decoder(dec, _) => dec.get_mut(),
        }
    }
}

impl StreamCodec for GzipCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Gzip
    }

    fn direction(&self) -> Direction {
        match self.inner {
            Inner::Encoder(_) => Direction::Compress,
            Inner::Decoder(..) => Direction::Decompress,
        }
    }

    fn process(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> Result<Progress, CompressError> {
        let mut consumed = 0;
        if !self.finished && !input.is_empty() {
            let before = self.pending().len();
            match &mut self.inner {
                Inner::Encoder(enc) => enc.write_all(input)?,
                Inner::Decoder(dec, totals) => {
                    dec.write_all(input)?;
                    let inflated = dec.get_ref().len() - before;
                    totals.record(input.len(), inflated)?;
                }
            }
            consumed = input.len();
        }

        if finish && !self.finished {
            match &mut self.inner {
                Inner::Encoder(enc) => enc.try_finish()?,
                Inner::Decoder(dec, _) => dec.try_finish()?,
            }
            self.finished = true;
        }

        let pending = self.pending_mut();
        let produced = pending.len().min(output.len());
        output[..produced].copy_from_slice(&pending[..produced]);
        pending.drain(..produced);

        let status = if !pending.is_empty() {
            CodecStatus::BufferFull
        } else if self.finished {
            CodecStatus::Done
        } else {
            CodecStatus::Ok
        };

        Ok(Progress { consumed, produced, status })
    }
}
