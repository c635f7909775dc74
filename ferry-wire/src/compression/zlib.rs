use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::{CodecStatus, CompressError, CompressionMethod, Direction, Progress, StreamCodec, Totals};

enum Inner {
    Deflate(Compress),
    Inflate(Decompress, Totals),
}

/// A zlib codec built on `flate2`'s low-level streams.
pub struct ZlibCodec {
    inner: Inner,
    done: bool,
}

impl std::fmt::Debug for ZlibCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibCodec").field("direction", &self.direction()).field("done", &self.done).finish()
    }
}

impl ZlibCodec {
    /// Creates a zlib compressor with the given level (0-9).
    pub fn compressor(level: u32) -> Self {
        Self { inner: Inner::Deflate(Compress::new(Compression::new(level.min(9)), true)), done: false }
    }

    pub fn decompressor() -> Self {
        Self { inner: Inner::Inflate(Decompress::new(true), Totals::default()), done: false }
    }
}

impl StreamCodec for ZlibCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zlib
    }

    fn direction(&self) -> Direction {
        match self.inner {
            Inner::Deflate(_) => Direction::Compress,
            Inner::Inflate(..) => Direction::Decompress,
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

        let (status, consumed, produced) = match &mut self.inner {
            Inner::Deflate(stream) => {
                let (in_before, out_before) = (stream.total_in(), stream.total_out());
                let flush = if finish { FlushCompress::Finish } else { FlushCompress::None };
                let status = stream.compress(input, output, flush)?;
                (
                    status,
                    (stream.total_in() - in_before) as usize,
                    (stream.total_out() - out_before) as usize,
                )
            }
            Inner::Inflate(stream, totals) => {
                let (in_before, out_before) = (stream.total_in(), stream.total_out());
                let flush = if finish { FlushDecompress::Finish } else { FlushDecompress::None };
                let status = stream.decompress(input, output, flush)?;
                let consumed = (stream.total_in() - in_before) as usize;
                let produced = (stream.total_out() - out_before) as usize;
                totals.record(consumed, produced)?;
                (status, consumed, produced)
            }
        };

        let status = match status {
            Status::StreamEnd => {
                self.done = true;
                CodecStatus::Done
            }
            Status::Ok if produced == output.len() || finish => CodecStatus::BufferFull,
            Status::Ok => CodecStatus::Ok,
            Status::BufError if consumed == input.len() && !finish => CodecStatus::Ok,
            Status::BufError => CodecStatus::BufferFull,
        };

        Ok(Progress { consumed, produced, status })
    }
}
