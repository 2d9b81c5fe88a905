//! Tile codec layer
//!
//! Every codec maps a byte buffer to a byte buffer. Compressors return the
//! compressed bytes; decompressors are handed an output slice already sized
//! to the raw tile and must fill it exactly or fail. All codecs are lossless
//! and deterministic.
//!
//! The coordinate RLE variants and double-delta need layout hints (cell size
//! and dimension count); these travel in a [`CodecCtx`] so the write and
//! read states do not special-case individual algorithms.

use std::io::{Read, Write};

use crate::error::{Result, StoreError};

/// Maximum run length representable by the RLE wire format.
const RLE_MAX_RUN: u64 = u16::MAX as u64;

/// Blosc sub-algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloscSub {
    BloscLz,
    Lz4,
    Lz4Hc,
    Snappy,
    Zlib,
    Zstd,
}

/// Tile compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Identity
    None,
    /// DEFLATE with gzip framing
    Gzip,
    /// Zstandard
    Zstd,
    /// LZ4 block format, size-prepended
    Lz4,
    /// Byte-shuffle by element size, then the sub-algorithm
    Blosc(BloscSub),
    /// BZip2
    Bzip2,
    /// Double-delta, integers only, per-dimension batches for coordinates
    DoubleDelta,
    /// Generic run-length encoding over fixed-size values
    Rle,
    /// Coordinate RLE, row-major: first d-1 dimensions run-length encoded,
    /// last dimension verbatim
    RleCoordsRow,
    /// Coordinate RLE, column-major: mirror image of the row variant
    RleCoordsCol,
}

impl Codec {
    /// Stable on-disk code for schema serialization
    pub fn code(self) -> u8 {
        match self {
            Codec::None => 0,
            Codec::Gzip => 1,
            Codec::Zstd => 2,
            Codec::Lz4 => 3,
            Codec::Blosc(BloscSub::BloscLz) => 4,
            Codec::Blosc(BloscSub::Lz4) => 5,
            Codec::Blosc(BloscSub::Lz4Hc) => 6,
            Codec::Blosc(BloscSub::Snappy) => 7,
            Codec::Blosc(BloscSub::Zlib) => 8,
            Codec::Blosc(BloscSub::Zstd) => 9,
            Codec::Bzip2 => 10,
            Codec::DoubleDelta => 11,
            Codec::Rle => 12,
            Codec::RleCoordsRow => 13,
            Codec::RleCoordsCol => 14,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Codec::None,
            1 => Codec::Gzip,
            2 => Codec::Zstd,
            3 => Codec::Lz4,
            4 => Codec::Blosc(BloscSub::BloscLz),
            5 => Codec::Blosc(BloscSub::Lz4),
            6 => Codec::Blosc(BloscSub::Lz4Hc),
            7 => Codec::Blosc(BloscSub::Snappy),
            8 => Codec::Blosc(BloscSub::Zlib),
            9 => Codec::Blosc(BloscSub::Zstd),
            10 => Codec::Bzip2,
            11 => Codec::DoubleDelta,
            12 => Codec::Rle,
            13 => Codec::RleCoordsRow,
            14 => Codec::RleCoordsCol,
            other => {
                return Err(StoreError::Decode(format!(
                    "unknown compressor code {}",
                    other
                )))
            }
        })
    }

    /// Whether the codec only makes sense on fixed-size cells
    pub fn requires_fixed_cells(self) -> bool {
        matches!(
            self,
            Codec::Rle | Codec::RleCoordsRow | Codec::RleCoordsCol | Codec::DoubleDelta
        )
    }
}

/// Layout hints for value-aware codecs
#[derive(Debug, Clone, Copy)]
pub struct CodecCtx {
    /// Size of one value in bytes: the cell size for RLE, the element size
    /// for blosc shuffling and double-delta
    pub value_size: usize,
    /// Number of dimensions for coordinate tiles, 1 otherwise
    pub dim_num: usize,
}

impl CodecCtx {
    pub fn new(value_size: usize, dim_num: usize) -> Self {
        Self {
            value_size,
            dim_num,
        }
    }
}

/// Compress `input`, returning the encoded bytes.
///
/// `level` applies to the level-configurable algorithms; non-positive means
/// the algorithm default.
pub fn compress(codec: Codec, level: i32, ctx: CodecCtx, input: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(input.to_vec()),
        Codec::Gzip => gzip_compress(input, gzip_level(level)),
        Codec::Zstd => zstd::bulk::compress(input, if level > 0 { level } else { 0 })
            .map_err(|e| StoreError::Encode(format!("zstd: {}", e))),
        Codec::Lz4 => Ok(lz4_flex::block::compress_prepend_size(input)),
        Codec::Blosc(sub) => blosc_compress(sub, level, ctx.value_size, input),
        Codec::Bzip2 => bzip2_compress(input, level),
        Codec::DoubleDelta => dd_compress(input, ctx),
        Codec::Rle => rle_compress(input, ctx.value_size),
        Codec::RleCoordsRow => rle_compress_coords(input, ctx, true),
        Codec::RleCoordsCol => rle_compress_coords(input, ctx, false),
    }
}

/// Decompress `input` into `output`, which must be sized to the raw tile.
pub fn decompress(codec: Codec, ctx: CodecCtx, input: &[u8], output: &mut [u8]) -> Result<()> {
    match codec {
        Codec::None => {
            if input.len() != output.len() {
                return Err(StoreError::Decode(format!(
                    "raw tile is {} bytes, expected {}",
                    input.len(),
                    output.len()
                )));
            }
            output.copy_from_slice(input);
            Ok(())
        }
        Codec::Gzip => gzip_decompress(input, output),
        Codec::Zstd => {
            let raw = zstd::bulk::decompress(input, output.len())
                .map_err(|e| StoreError::Decode(format!("zstd: {}", e)))?;
            fill_exact(&raw, output)
        }
        Codec::Lz4 => {
            let raw = lz4_flex::block::decompress_size_prepended(input)
                .map_err(|e| StoreError::Decode(format!("lz4: {}", e)))?;
            fill_exact(&raw, output)
        }
        Codec::Blosc(sub) => blosc_decompress(sub, ctx.value_size, input, output),
        Codec::Bzip2 => bzip2_decompress(input, output),
        Codec::DoubleDelta => dd_decompress(input, ctx, output),
        Codec::Rle => rle_decompress(input, ctx.value_size, output),
        Codec::RleCoordsRow => rle_decompress_coords(input, ctx, output, true),
        Codec::RleCoordsCol => rle_decompress_coords(input, ctx, output, false),
    }
}

fn fill_exact(raw: &[u8], output: &mut [u8]) -> Result<()> {
    if raw.len() != output.len() {
        return Err(StoreError::Decode(format!(
            "decompressed to {} bytes, expected {}",
            raw.len(),
            output.len()
        )));
    }
    output.copy_from_slice(raw);
    Ok(())
}

fn gzip_level(level: i32) -> u32 {
    if level > 0 {
        (level as u32).min(9)
    } else {
        6
    }
}

fn gzip_compress(input: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
    encoder
        .write_all(input)
        .and_then(|_| encoder.finish())
        .map_err(|e| StoreError::Encode(format!("gzip: {}", e)))
}

fn gzip_decompress(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut decoder = flate2::read::GzDecoder::new(input);
    decoder
        .read_exact(output)
        .map_err(|e| StoreError::Decode(format!("gzip: {}", e)))?;
    // The stream must not hold more than the expected tile.
    let mut probe = [0u8; 1];
    match decoder.read(&mut probe) {
        Ok(0) => Ok(()),
        Ok(_) => Err(StoreError::Decode(
            "gzip stream longer than expected tile".to_string(),
        )),
        Err(e) => Err(StoreError::Decode(format!("gzip: {}", e))),
    }
}

/// Gzip-wrap a whole sidecar file (bookkeeping, schema)
pub fn gzip_frame(input: &[u8]) -> Result<Vec<u8>> {
    gzip_compress(input, 6)
}

/// Unwrap a gzip-framed sidecar file of unknown raw size
pub fn gzip_unframe(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| StoreError::Decode(format!("gzip: {}", e)))?;
    Ok(raw)
}

fn bzip2_compress(input: &[u8], level: i32) -> Result<Vec<u8>> {
    let level = if level > 0 { (level as u32).min(9) } else { 6 };
    let mut encoder = bzip2::read::BzEncoder::new(input, bzip2::Compression::new(level));
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .map_err(|e| StoreError::Encode(format!("bzip2: {}", e)))?;
    Ok(out)
}

fn bzip2_decompress(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut decoder = bzip2::read::BzDecoder::new(input);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| StoreError::Decode(format!("bzip2: {}", e)))?;
    fill_exact(&raw, output)
}

/* ------------------------------ blosc ------------------------------ */

/// Byte-shuffle: gather byte `b` of every element together. Elements whose
/// trailing bytes do not fill a whole element are copied verbatim.
fn shuffle(input: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 {
        return input.to_vec();
    }
    let elem_num = input.len() / elem_size;
    let body = elem_num * elem_size;
    let mut out = Vec::with_capacity(input.len());
    for b in 0..elem_size {
        for i in 0..elem_num {
            out.push(input[i * elem_size + b]);
        }
    }
    out.extend_from_slice(&input[body..]);
    out
}

fn unshuffle(input: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 {
        return input.to_vec();
    }
    let elem_num = input.len() / elem_size;
    let body = elem_num * elem_size;
    let mut out = vec![0u8; input.len()];
    for b in 0..elem_size {
        for i in 0..elem_num {
            out[i * elem_size + b] = input[b * elem_num + i];
        }
    }
    out[body..].copy_from_slice(&input[body..]);
    out
}

fn blosc_compress(sub: BloscSub, level: i32, elem_size: usize, input: &[u8]) -> Result<Vec<u8>> {
    let shuffled = shuffle(input, elem_size);
    match sub {
        BloscSub::BloscLz | BloscSub::Lz4 | BloscSub::Lz4Hc => {
            Ok(lz4_flex::block::compress_prepend_size(&shuffled))
        }
        BloscSub::Snappy => snap::raw::Encoder::new()
            .compress_vec(&shuffled)
            .map_err(|e| StoreError::Encode(format!("snappy: {}", e))),
        BloscSub::Zlib => {
            let mut encoder = flate2::write::ZlibEncoder::new(
                Vec::new(),
                flate2::Compression::new(gzip_level(level)),
            );
            encoder
                .write_all(&shuffled)
                .and_then(|_| encoder.finish())
                .map_err(|e| StoreError::Encode(format!("zlib: {}", e)))
        }
        BloscSub::Zstd => zstd::bulk::compress(&shuffled, if level > 0 { level } else { 0 })
            .map_err(|e| StoreError::Encode(format!("zstd: {}", e))),
    }
}

fn blosc_decompress(
    sub: BloscSub,
    elem_size: usize,
    input: &[u8],
    output: &mut [u8],
) -> Result<()> {
    let shuffled = match sub {
        BloscSub::BloscLz | BloscSub::Lz4 | BloscSub::Lz4Hc => {
            lz4_flex::block::decompress_size_prepended(input)
                .map_err(|e| StoreError::Decode(format!("lz4: {}", e)))?
        }
        BloscSub::Snappy => snap::raw::Decoder::new()
            .decompress_vec(input)
            .map_err(|e| StoreError::Decode(format!("snappy: {}", e)))?,
        BloscSub::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(input);
            let mut raw = Vec::new();
            decoder
                .read_to_end(&mut raw)
                .map_err(|e| StoreError::Decode(format!("zlib: {}", e)))?;
            raw
        }
        BloscSub::Zstd => zstd::bulk::decompress(input, output.len())
            .map_err(|e| StoreError::Decode(format!("zstd: {}", e)))?,
    };
    fill_exact(&unshuffle(&shuffled, elem_size), output)
}

/* ------------------------------- RLE ------------------------------- */

fn push_run(out: &mut Vec<u8>, value: &[u8], run_len: u64) {
    out.extend_from_slice(value);
    out.extend_from_slice(&(run_len as u16).to_le_bytes());
}

/// Generic RLE over fixed-size values: `value || run_len:u16 LE` pairs,
/// runs longer than 65535 split at the cap.
fn rle_compress(input: &[u8], value_size: usize) -> Result<Vec<u8>> {
    if value_size == 0 || input.len() % value_size != 0 {
        return Err(StoreError::Encode(
            "RLE input is not a whole number of values".to_string(),
        ));
    }
    let value_num = input.len() / value_size;
    let mut out = Vec::new();
    if value_num == 0 {
        return Ok(out);
    }

    let mut prev = &input[..value_size];
    let mut run_len = 1u64;
    for i in 1..value_num {
        let cur = &input[i * value_size..(i + 1) * value_size];
        if cur == prev && run_len < RLE_MAX_RUN {
            run_len += 1;
        } else {
            push_run(&mut out, prev, run_len);
            run_len = 1;
        }
        prev = cur;
    }
    push_run(&mut out, prev, run_len);
    Ok(out)
}

fn rle_decompress(input: &[u8], value_size: usize, output: &mut [u8]) -> Result<()> {
    let run_size = value_size + 2;
    if value_size == 0 || input.len() % run_size != 0 {
        return Err(StoreError::Decode(
            "RLE input is not a whole number of runs".to_string(),
        ));
    }
    let mut written = 0usize;
    for run in input.chunks(run_size) {
        let value = &run[..value_size];
        let run_len = u16::from_le_bytes([run[value_size], run[value_size + 1]]) as usize;
        let bytes = run_len * value_size;
        if written + bytes > output.len() {
            return Err(StoreError::Decode("RLE output overflow".to_string()));
        }
        for _ in 0..run_len {
            output[written..written + value_size].copy_from_slice(value);
            written += value_size;
        }
    }
    if written != output.len() {
        return Err(StoreError::Decode(format!(
            "RLE produced {} bytes, expected {}",
            written,
            output.len()
        )));
    }
    Ok(())
}

/// Run-length encode a single dimension of an interleaved coordinate buffer.
fn rle_runs_for_dim(
    out: &mut Vec<u8>,
    input: &[u8],
    coords_num: usize,
    coords_size: usize,
    value_size: usize,
    dim: usize,
) {
    let at = |i: usize| &input[i * coords_size + dim * value_size..][..value_size];
    let mut prev = at(0);
    let mut run_len = 1u64;
    for i in 1..coords_num {
        let cur = at(i);
        if cur == prev && run_len < RLE_MAX_RUN {
            run_len += 1;
        } else {
            push_run(out, prev, run_len);
            run_len = 1;
        }
        prev = cur;
    }
    push_run(out, prev, run_len);
}

/// Coordinate RLE. Row-major: cell count, runs for the first d-1 dimensions,
/// last dimension verbatim. Column-major: cell count, first dimension
/// verbatim, runs for the remaining d-1 dimensions.
fn rle_compress_coords(input: &[u8], ctx: CodecCtx, row_major: bool) -> Result<Vec<u8>> {
    let value_size = ctx.value_size;
    let dim_num = ctx.dim_num;
    let coords_size = value_size * dim_num;
    if dim_num == 0 || coords_size == 0 || input.len() % coords_size != 0 {
        return Err(StoreError::Encode(
            "coordinate RLE input is not a whole number of cells".to_string(),
        ));
    }
    let coords_num = input.len() / coords_size;
    let mut out = Vec::new();
    if coords_num == 0 {
        return Ok(out);
    }
    out.extend_from_slice(&(coords_num as i64).to_le_bytes());

    let verbatim = |out: &mut Vec<u8>, dim: usize| {
        for i in 0..coords_num {
            out.extend_from_slice(&input[i * coords_size + dim * value_size..][..value_size]);
        }
    };

    if row_major {
        for d in 0..dim_num - 1 {
            rle_runs_for_dim(&mut out, input, coords_num, coords_size, value_size, d);
        }
        verbatim(&mut out, dim_num - 1);
    } else {
        verbatim(&mut out, 0);
        for d in 1..dim_num {
            rle_runs_for_dim(&mut out, input, coords_num, coords_size, value_size, d);
        }
    }
    Ok(out)
}

fn rle_decompress_coords(
    input: &[u8],
    ctx: CodecCtx,
    output: &mut [u8],
    row_major: bool,
) -> Result<()> {
    let value_size = ctx.value_size;
    let dim_num = ctx.dim_num;
    let coords_size = value_size * dim_num;
    if input.is_empty() {
        return if output.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Decode("empty coordinate RLE input".to_string()))
        };
    }
    if input.len() < 8 {
        return Err(StoreError::Decode("coordinate RLE input too short".to_string()));
    }
    let coords_num = i64::from_le_bytes(input[..8].try_into().expect("8 bytes")) as usize;
    if coords_num * coords_size != output.len() {
        return Err(StoreError::Decode(format!(
            "coordinate RLE holds {} cells, expected {}",
            coords_num,
            output.len() / coords_size.max(1)
        )));
    }
    let mut pos = 8usize;
    let run_size = value_size + 2;

    let read_verbatim = |pos: &mut usize, dim: usize, output: &mut [u8]| -> Result<()> {
        if *pos + coords_num * value_size > input.len() {
            return Err(StoreError::Decode("coordinate RLE input overflow".to_string()));
        }
        for i in 0..coords_num {
            output[i * coords_size + dim * value_size..][..value_size]
                .copy_from_slice(&input[*pos..*pos + value_size]);
            *pos += value_size;
        }
        Ok(())
    };

    let rle_dims: Vec<usize> = if row_major {
        (0..dim_num - 1).collect()
    } else {
        (1..dim_num).collect()
    };

    if !row_major {
        read_verbatim(&mut pos, 0, &mut *output)?;
    }

    // Runs for all encoded dimensions are concatenated; a dimension ends
    // when its runs have produced coords_num values.
    for &d in &rle_dims {
        let mut produced = 0usize;
        while produced < coords_num {
            if pos + run_size > input.len() {
                return Err(StoreError::Decode("coordinate RLE input overflow".to_string()));
            }
            let value = &input[pos..pos + value_size];
            let run_len =
                u16::from_le_bytes([input[pos + value_size], input[pos + value_size + 1]])
                    as usize;
            pos += run_size;
            if produced + run_len > coords_num {
                return Err(StoreError::Decode("coordinate RLE run overflow".to_string()));
            }
            for _ in 0..run_len {
                output[produced * coords_size + d * value_size..][..value_size]
                    .copy_from_slice(value);
                produced += 1;
            }
        }
    }

    if row_major {
        read_verbatim(&mut pos, dim_num - 1, &mut *output)?;
    }

    if pos != input.len() {
        return Err(StoreError::Decode(
            "trailing bytes in coordinate RLE input".to_string(),
        ));
    }
    Ok(())
}

/* --------------------------- double delta --------------------------- */

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn read_varint(input: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *input
            .get(*pos)
            .ok_or_else(|| StoreError::Decode("double-delta input overflow".to_string()))?;
        *pos += 1;
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(StoreError::Decode("double-delta varint too long".to_string()));
        }
    }
}

fn load_le(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        v |= u64::from(*b) << (8 * i);
    }
    v
}

fn store_le(v: u64, bytes: &mut [u8]) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (v >> (8 * i)) as u8;
    }
}

fn width_mask(value_size: usize) -> u64 {
    if value_size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * value_size)) - 1
    }
}

fn sign_extend(v: u64, value_size: usize) -> i64 {
    if value_size >= 8 {
        return v as i64;
    }
    let shift = 64 - 8 * value_size as u32;
    ((v << shift) as i64) >> shift
}

/// Double-delta one batch of same-dimension values.
///
/// Batch layout: `count:u64 LE`, first value raw, second value raw, then
/// zigzag varints of the second differences. Arithmetic wraps at the value
/// width, so the encoding is exact for any integer input.
fn dd_compress_batch(out: &mut Vec<u8>, values: &[u8], value_size: usize) {
    let mask = width_mask(value_size);
    let n = values.len() / value_size;
    out.extend_from_slice(&(n as u64).to_le_bytes());
    if n == 0 {
        return;
    }
    let at = |i: usize| load_le(&values[i * value_size..(i + 1) * value_size]);
    out.extend_from_slice(&values[..value_size]);
    if n == 1 {
        return;
    }
    out.extend_from_slice(&values[value_size..2 * value_size]);
    let mut prev = at(1);
    let mut prev_delta = at(1).wrapping_sub(at(0)) & mask;
    for i in 2..n {
        let cur = at(i);
        let delta = cur.wrapping_sub(prev) & mask;
        let dd = delta.wrapping_sub(prev_delta) & mask;
        write_varint(out, zigzag(sign_extend(dd, value_size)));
        prev = cur;
        prev_delta = delta;
    }
}

fn dd_decompress_batch(
    input: &[u8],
    pos: &mut usize,
    out: &mut Vec<u8>,
    value_size: usize,
) -> Result<()> {
    let mask = width_mask(value_size);
    if *pos + 8 > input.len() {
        return Err(StoreError::Decode("double-delta input overflow".to_string()));
    }
    let n = u64::from_le_bytes(input[*pos..*pos + 8].try_into().expect("8 bytes")) as usize;
    *pos += 8;
    if n == 0 {
        return Ok(());
    }
    let take_raw = |pos: &mut usize| -> Result<u64> {
        if *pos + value_size > input.len() {
            return Err(StoreError::Decode("double-delta input overflow".to_string()));
        }
        let v = load_le(&input[*pos..*pos + value_size]);
        *pos += value_size;
        Ok(v)
    };
    let push = |v: u64, out: &mut Vec<u8>| {
        let start = out.len();
        out.resize(start + value_size, 0);
        store_le(v & mask, &mut out[start..]);
    };

    let first = take_raw(pos)?;
    push(first, out);
    if n == 1 {
        return Ok(());
    }
    let second = take_raw(pos)?;
    push(second, out);
    let mut prev = second;
    let mut prev_delta = second.wrapping_sub(first) & mask;
    for _ in 2..n {
        let dd = unzigzag(read_varint(input, pos)?) as u64 & mask;
        let delta = prev_delta.wrapping_add(dd) & mask;
        let cur = prev.wrapping_add(delta) & mask;
        push(cur, out);
        prev = cur;
        prev_delta = delta;
    }
    Ok(())
}

/// Double-delta over a tile. Coordinate tiles (`dim_num > 1`) are encoded as
/// one batch per dimension so each dimension's values stay consecutive.
fn dd_compress(input: &[u8], ctx: CodecCtx) -> Result<Vec<u8>> {
    let value_size = ctx.value_size;
    if !matches!(value_size, 1 | 2 | 4 | 8) {
        return Err(StoreError::Encode(
            "double-delta requires an integer value size".to_string(),
        ));
    }
    let dim_num = ctx.dim_num.max(1);
    let coords_size = value_size * dim_num;
    if input.len() % coords_size != 0 {
        return Err(StoreError::Encode(
            "double-delta input is not a whole number of cells".to_string(),
        ));
    }
    let cell_num = input.len() / coords_size;
    let mut out = Vec::new();
    if dim_num == 1 {
        dd_compress_batch(&mut out, input, value_size);
        return Ok(out);
    }
    let mut batch = Vec::with_capacity(cell_num * value_size);
    for d in 0..dim_num {
        batch.clear();
        for i in 0..cell_num {
            batch.extend_from_slice(&input[i * coords_size + d * value_size..][..value_size]);
        }
        dd_compress_batch(&mut out, &batch, value_size);
    }
    Ok(out)
}

fn dd_decompress(input: &[u8], ctx: CodecCtx, output: &mut [u8]) -> Result<()> {
    let value_size = ctx.value_size;
    if !matches!(value_size, 1 | 2 | 4 | 8) {
        return Err(StoreError::Decode(
            "double-delta requires an integer value size".to_string(),
        ));
    }
    let dim_num = ctx.dim_num.max(1);
    let coords_size = value_size * dim_num;
    let mut pos = 0usize;
    if dim_num == 1 {
        let mut raw = Vec::with_capacity(output.len());
        dd_decompress_batch(input, &mut pos, &mut raw, value_size)?;
        if pos != input.len() {
            return Err(StoreError::Decode(
                "trailing bytes in double-delta input".to_string(),
            ));
        }
        return fill_exact(&raw, output);
    }
    let cell_num = output.len() / coords_size;
    for d in 0..dim_num {
        let mut batch = Vec::with_capacity(cell_num * value_size);
        dd_decompress_batch(input, &mut pos, &mut batch, value_size)?;
        if batch.len() != cell_num * value_size {
            return Err(StoreError::Decode(format!(
                "double-delta batch holds {} values, expected {}",
                batch.len() / value_size,
                cell_num
            )));
        }
        for i in 0..cell_num {
            output[i * coords_size + d * value_size..][..value_size]
                .copy_from_slice(&batch[i * value_size..(i + 1) * value_size]);
        }
    }
    if pos != input.len() {
        return Err(StoreError::Decode(
            "trailing bytes in double-delta input".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: Codec, ctx: CodecCtx, input: &[u8]) {
        let encoded = compress(codec, -1, ctx, input).unwrap();
        let mut output = vec![0u8; input.len()];
        decompress(codec, ctx, &encoded, &mut output).unwrap();
        assert_eq!(output, input, "round-trip mismatch for {:?}", codec);
    }

    fn sample_values() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..2000i32 {
            data.extend_from_slice(&(i / 7).to_le_bytes());
        }
        data
    }

    #[test]
    fn test_byte_codecs_roundtrip() {
        let data = sample_values();
        let ctx = CodecCtx::new(4, 1);
        for codec in [
            Codec::None,
            Codec::Gzip,
            Codec::Zstd,
            Codec::Lz4,
            Codec::Bzip2,
            Codec::Rle,
            Codec::DoubleDelta,
        ] {
            roundtrip(codec, ctx, &data);
        }
    }

    #[test]
    fn test_blosc_subs_roundtrip() {
        let data = sample_values();
        let ctx = CodecCtx::new(4, 1);
        for sub in [
            BloscSub::BloscLz,
            BloscSub::Lz4,
            BloscSub::Lz4Hc,
            BloscSub::Snappy,
            BloscSub::Zlib,
            BloscSub::Zstd,
        ] {
            roundtrip(Codec::Blosc(sub), ctx, &data);
        }
    }

    #[test]
    fn test_shuffle_unshuffle() {
        let data: Vec<u8> = (0u8..101).collect();
        assert_eq!(unshuffle(&shuffle(&data, 4), 4), data);
    }

    #[test]
    fn test_rle_run_encoding() {
        // Three runs: 5 x 7, 1 x 9, 2 x 7 over i32 values
        let mut data = Vec::new();
        for v in [7, 7, 7, 7, 7, 9, 7, 7i32] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let encoded = compress(Codec::Rle, -1, CodecCtx::new(4, 1), &data).unwrap();
        assert_eq!(encoded.len(), 3 * 6);
        assert_eq!(&encoded[..4], &7i32.to_le_bytes());
        assert_eq!(u16::from_le_bytes([encoded[4], encoded[5]]), 5);
        let mut output = vec![0u8; data.len()];
        decompress(Codec::Rle, CodecCtx::new(4, 1), &encoded, &mut output).unwrap();
        assert_eq!(output, data);
    }

    #[test]
    fn test_rle_run_cap_split() {
        let value = 3u8;
        let data = vec![value; 70000];
        let encoded = compress(Codec::Rle, -1, CodecCtx::new(1, 1), &data).unwrap();
        // 65535 + 4465 => two runs
        assert_eq!(encoded.len(), 2 * 3);
        assert_eq!(u16::from_le_bytes([encoded[1], encoded[2]]), 65535);
        let mut output = vec![0u8; data.len()];
        decompress(Codec::Rle, CodecCtx::new(1, 1), &encoded, &mut output).unwrap();
        assert_eq!(output, data);
    }

    fn coords_2d() -> Vec<u8> {
        // Row-major walk of a 4x5 grid: first dim has long runs
        let mut data = Vec::new();
        for r in 0..4i32 {
            for c in 0..5i32 {
                data.extend_from_slice(&r.to_le_bytes());
                data.extend_from_slice(&c.to_le_bytes());
            }
        }
        data
    }

    #[test]
    fn test_rle_coords_row_roundtrip() {
        let data = coords_2d();
        let ctx = CodecCtx::new(4, 2);
        roundtrip(Codec::RleCoordsRow, ctx, &data);

        // First dimension compresses to 4 runs of 5
        let encoded = compress(Codec::RleCoordsRow, -1, ctx, &data).unwrap();
        assert_eq!(
            i64::from_le_bytes(encoded[..8].try_into().unwrap()),
            20
        );
        assert_eq!(u16::from_le_bytes([encoded[12], encoded[13]]), 5);
    }

    #[test]
    fn test_rle_coords_col_roundtrip() {
        let data = coords_2d();
        roundtrip(Codec::RleCoordsCol, CodecCtx::new(4, 2), &data);
    }

    #[test]
    fn test_rle_coords_3d_roundtrip() {
        let mut data = Vec::new();
        for x in 0..3i64 {
            for y in 0..4i64 {
                for z in 0..2i64 {
                    for v in [x, y, z] {
                        data.extend_from_slice(&v.to_le_bytes());
                    }
                }
            }
        }
        roundtrip(Codec::RleCoordsRow, CodecCtx::new(8, 3), &data);
        roundtrip(Codec::RleCoordsCol, CodecCtx::new(8, 3), &data);
    }

    #[test]
    fn test_double_delta_coords() {
        let data = coords_2d();
        roundtrip(Codec::DoubleDelta, CodecCtx::new(4, 2), &data);
    }

    #[test]
    fn test_double_delta_negative_and_wrap() {
        let mut data = Vec::new();
        for v in [i64::MIN, -1, 0, 1, i64::MAX, 42, 42, 41] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        roundtrip(Codec::DoubleDelta, CodecCtx::new(8, 1), &data);
    }

    #[test]
    fn test_empty_input() {
        let ctx = CodecCtx::new(4, 1);
        for codec in [Codec::Rle, Codec::DoubleDelta, Codec::Gzip, Codec::Lz4] {
            let encoded = compress(codec, -1, ctx, &[]).unwrap();
            let mut output = vec![0u8; 0];
            decompress(codec, ctx, &encoded, &mut output).unwrap();
        }
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        let data = sample_values();
        let encoded = compress(Codec::Zstd, -1, CodecCtx::new(4, 1), &data).unwrap();
        let mut short = vec![0u8; data.len() - 4];
        assert!(decompress(Codec::Zstd, CodecCtx::new(4, 1), &encoded, &mut short).is_err());
    }

    #[test]
    fn test_gzip_frame_unframe() {
        let data = b"book keeping payload".to_vec();
        let framed = gzip_frame(&data).unwrap();
        assert_eq!(gzip_unframe(&framed).unwrap(), data);
    }

    #[test]
    fn test_codec_codes_stable() {
        for code in 0..=14u8 {
            assert_eq!(Codec::from_code(code).unwrap().code(), code);
        }
        assert!(Codec::from_code(99).is_err());
    }
}
