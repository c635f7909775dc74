use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use super::{CodecStatus, CompressError, CompressionMethod, Direction, Progress, StreamCodec, Totals};

enum Inner {
    Encoder(Encoder<'static>),
    Decoder(Decoder<'static>, Totals),
}

/// A zstd codec on top of the raw streaming API.
pub struct ZstdCodec {
    inner: Inner,
    done: bool,
}

impl std::fmt::Debug for ZstdCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZstdCodec").field("direction", &self.direction()).field("done", &self.done).finish()
    }
}

impl ZstdCodec {
    /// Creates a zstd compressor with the given level. zstd's own default is 3.
    pub fn compressor(level: i32) -> Result<Self, CompressError> {
        Ok(Self { inner: Inner::Encoder(Encoder::new(level)?), done: false })
    }

    pub fn decompressor() -> Result<Self, CompressError> {
        Ok(Self { inner: Inner::Decoder(Decoder::new()?, Totals::default()), done: false })
    }
}

impl StreamCodec for ZstdCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
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
        if self.done {
            return Ok(Progress { consumed: 0, produced: 0, status: CodecStatus::Done });
        }

        let capacity = output.len();
        let mut src = InBuffer::around(input);
        let mut dst = OutBuffer::around(output);

        match &mut self.inner {
            Inner::Encoder(enc) => {
                enc.run(&mut src, &mut dst)?;
                if finish && src.pos() == input.len() {
                    // Zero bytes left to flush means the frame epilogue is fully written.
                    self.done = enc.finish(&mut dst, true)? == 0;
                }
            }
            Inner::Decoder(dec, totals) => {
                // A zero hint means a frame was fully decoded and flushed.
                let hint = dec.run(&mut src, &mut dst)?;
                totals.record(src.pos(), dst.pos())?;
                self.done = hint == 0;
            }
        }

        let consumed = src.pos();
        let produced = dst.pos();
        let status = if self.done {
            CodecStatus::Done
        } else if produced == capacity || (finish && consumed == 0 && produced == 0) {
            CodecStatus::BufferFull
        } else {
            CodecStatus::Ok
        };

        Ok(Progress { consumed, produced, status })
    }
}
