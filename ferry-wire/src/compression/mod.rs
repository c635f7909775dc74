use std::io;

use thiserror::Error;
use tracing::trace;

use crate::buf::{Buffer, DEFAULT_CHUNK_SIZE};

mod gzip;
mod zlib;
mod zstd;
pub use self::zstd::ZstdCodec;
pub use gzip::GzipCodec;
pub use zlib::ZlibCodec;

/// Decompressed output is only checked for suspicious ratios past this many bytes.
pub const CHECK_FOR_COMPRESSION_BOMB_AFTER: u64 = 64 * 1024;
/// Largest accepted ratio of decompressed to compressed bytes.
pub const MAX_UNCOMPRESSION_FACTOR: u64 = 25;

/// The compression method applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionMethod {
    None = 0,
    Gzip = 1,
    Zlib = 2,
    Zstd = 3,
}

impl TryFrom<u8> for CompressionMethod {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Zlib),
            3 => Ok(Self::Zstd),
            _ => Err(value),
        }
    }
}

/// Guesses the compression method from the first bytes of a stream.
pub fn detect_method(prefix: &[u8]) -> CompressionMethod {
    match prefix {
        [0x1f, 0x8b, ..] => CompressionMethod::Gzip,
        [0x28, 0xb5, 0x2f, 0xfd, ..] => CompressionMethod::Zstd,
        // CMF byte with the deflate method and a header checksum that divides by 31.
        [cmf, flg, ..] if cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0 => {
            CompressionMethod::Zlib
        }
        _ => CompressionMethod::None,
    }
}

/// Whether a codec compresses or decompresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Compress,
    Decompress,
}

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("Deflate error: {0}")]
    Deflate(#[from] flate2::CompressError),
    #[error("Inflate error: {0}")]
    Inflate(#[from] flate2::DecompressError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Codec stopped making progress, input is truncated or corrupt")]
    Stalled,
    #[error("Possible compression bomb: {output} bytes out of {input} bytes in")]
    Bomb { input: u64, output: u64 },
    #[error("Unsupported compression method: {0}")]
    Unsupported(u8),
}

/// What a codec reports after one [`StreamCodec::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStatus {
    /// The stream is complete; nothing more will be produced.
    Done,
    /// The output slice was filled (or more room is needed) before all input was handled.
    BufferFull,
    /// All available input was handled; feed more.
    Ok,
}

/// The result of a single [`StreamCodec::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub consumed: usize,
    pub produced: usize,
    pub status: CodecStatus,
}

/// A streaming compressor or decompressor.
pub trait StreamCodec: Send {
    fn method(&self) -> CompressionMethod;

    fn direction(&self) -> Direction;

    /// Processes as much of `input` as fits into `output`. When `finish` is set, the codec
    /// flushes its internal state and terminates the stream once all input is consumed.
    fn process(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> Result<Progress, CompressError>;
}

/// Creates a codec for `method`. `level` is ignored when decompressing.
pub fn codec_for(
    method: CompressionMethod,
    direction: Direction,
    level: u32,
) -> Result<Box<dyn StreamCodec>, CompressError> {
    let codec: Box<dyn StreamCodec> = match (method, direction) {
        (CompressionMethod::None, _) => return Err(CompressError::Unsupported(method as u8)),
        (CompressionMethod::Gzip, Direction::Compress) => Box::new(GzipCodec::compressor(level)),
        (CompressionMethod::Gzip, Direction::Decompress) => Box::new(GzipCodec::decompressor()),
        (CompressionMethod::Zlib, Direction::Compress) => Box::new(ZlibCodec::compressor(level)),
        (CompressionMethod::Zlib, Direction::Decompress) => Box::new(ZlibCodec::decompressor()),
        (CompressionMethod::Zstd, Direction::Compress) => {
            Box::new(ZstdCodec::compressor(level as i32)?)
        }
        (CompressionMethod::Zstd, Direction::Decompress) => Box::new(ZstdCodec::decompressor()?),
    };

    Ok(codec)
}

/// Returns `true` if inflating `input` bytes into `output` bytes looks like a decompression bomb.
pub fn is_compression_bomb(input: u64, output: u64) -> bool {
    if input == 0 || output < CHECK_FOR_COMPRESSION_BOMB_AFTER {
        return false;
    }
    output / input > MAX_UNCOMPRESSION_FACTOR
}

/// Running byte totals of a decompressor, used for bomb detection.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Totals {
    input: u64,
    output: u64,
}

impl Totals {
    pub(crate) fn record(&mut self, consumed: usize, produced: usize) -> Result<(), CompressError> {
        self.input += consumed as u64;
        self.output += produced as u64;
        if is_compression_bomb(self.input, self.output) {
            return Err(CompressError::Bomb { input: self.input, output: self.output });
        }
        Ok(())
    }
}

impl Buffer {
    /// Streams `input` through `codec`, writing its output straight into the tail chunk's free
    /// space and adding chunks whenever the codec runs out of room. Returns the number of bytes
    /// appended.
    pub fn append_compressed(
        &mut self,
        codec: &mut dyn StreamCodec,
        mut input: &[u8],
        finish: bool,
    ) -> Result<usize, CompressError> {
        let before = self.len();
        let mut stalled = false;

        loop {
            let out = self.reserve_tail(input.len().max(DEFAULT_CHUNK_SIZE));
            let progress = codec.process(input, out, finish)?;
            self.commit_tail(progress.produced);
            input = &input[progress.consumed..];

            if progress.status == CodecStatus::Done {
                break;
            }
            if progress.status == CodecStatus::Ok && input.is_empty() && !finish {
                break;
            }

            if progress.consumed == 0 && progress.produced == 0 {
                // Give the codec one fresh chunk; a second stall means it can't go on.
                if stalled {
                    return Err(CompressError::Stalled);
                }
                stalled = true;
                self.add_chunk_with_capacity(DEFAULT_CHUNK_SIZE, true);
            } else {
                stalled = false;
            }
        }

        let appended = self.len() - before;
        trace!(method = ?codec.method(), direction = ?codec.direction(), appended, "Codec pass complete");
        Ok(appended)
    }
}
