//! Bounds-checked read/write cursors over byte buffers.
//!
//! A [`WriteCursor`] appends into a growable [`ByteBuffer`]; a [`ReadCursor`]
//! walks a borrowed byte slice. Both carry an active `[lower, upper)` window.
//! Every access is checked against that window and fails with
//! [`CodecError::BufferOverrun`] naming the violated side.
//!
//! Fields whose value is only known after later fields were written (lengths,
//! offsets) are encoded through a [`Hole`]: the provisional value is written
//! immediately and the returned handle rewrites exactly that field once,
//! without moving the live cursor. Holes store offsets, never references, so
//! buffer growth cannot invalidate them.

use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::error::{Bound, CodecError, CodecResult};

/// Byte order of a fixed-width field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first (the SMB2 default).
    Little,
    /// Most significant byte first (transport length prefixes).
    Big,
}

/// A fixed-width integer that can be placed on the wire.
pub trait Scalar: Copy + Sized {
    /// Encoded width in bytes.
    const WIDTH: usize;
    /// Writes `self` into `dst`, which is exactly `WIDTH` bytes long.
    fn put(self, dst: &mut [u8], endian: Endian);
    /// Reads a value from `src`, which is exactly `WIDTH` bytes long.
    fn get(src: &[u8], endian: Endian) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn put(self, dst: &mut [u8], endian: Endian) {
                    let bytes = match endian {
                        Endian::Little => self.to_le_bytes(),
                        Endian::Big => self.to_be_bytes(),
                    };
                    dst.copy_from_slice(&bytes);
                }

                fn get(src: &[u8], endian: Endian) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(src);
                    match endian {
                        Endian::Little => <$t>::from_le_bytes(raw),
                        Endian::Big => <$t>::from_be_bytes(raw),
                    }
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, u128, i8, i16, i32, i64);

/// Active `[lower, upper)` access window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    lower: usize,
    upper: usize,
}

impl Window {
    fn check(&self, offset: usize, size: usize) -> CodecResult<()> {
        let overrun = |bound| CodecError::BufferOverrun {
            offset,
            size,
            lower: self.lower,
            upper: self.upper,
            bound,
        };
        if offset < self.lower {
            return Err(overrun(Bound::Lower));
        }
        match offset.checked_add(size) {
            Some(end) if end <= self.upper => Ok(()),
            _ => Err(overrun(Bound::Upper)),
        }
    }

    /// Validates that `[lower, upper)` lies inside this window.
    fn narrow(&self, lower: usize, upper: usize) -> CodecResult<Window> {
        if lower < self.lower {
            return Err(CodecError::BufferOverrun {
                offset: lower,
                size: upper.saturating_sub(lower),
                lower: self.lower,
                upper: self.upper,
                bound: Bound::Lower,
            });
        }
        if upper > self.upper || upper < lower {
            return Err(CodecError::BufferOverrun {
                offset: lower,
                size: upper.saturating_sub(lower),
                lower: self.lower,
                upper: self.upper,
                bound: Bound::Upper,
            });
        }
        Ok(Window { lower, upper })
    }
}

/// A saved cursor offset, used to measure distances and as an alignment base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(pub usize);

impl Add<usize> for Position {
    type Output = Position;

    fn add(self, rhs: usize) -> Position {
        Position(self.0 + rhs)
    }
}

impl Sub for Position {
    type Output = usize;

    fn sub(self, rhs: Position) -> usize {
        self.0.saturating_sub(rhs.0)
    }
}

/// Growable byte storage that serialized messages are written into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    bytes: Vec<u8>,
}

impl ByteBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrows the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutably borrows the written bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Consumes the buffer, returning the bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// Writes `data` at `offset`, zero-filling any gap and growing as needed.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].copy_from_slice(data);
    }

    /// Overwrites an already-written scalar at `offset`.
    ///
    /// Unlike [`ByteBuffer::write_at`] this never grows the buffer: the field
    /// must have been encoded before.
    pub fn rewrite_at<T: Scalar>(&mut self, offset: usize, value: T, endian: Endian) -> CodecResult<()> {
        let window = Window {
            lower: 0,
            upper: self.bytes.len(),
        };
        window.check(offset, T::WIDTH)?;
        value.put(&mut self.bytes[offset..offset + T::WIDTH], endian);
        Ok(())
    }

    /// Drops everything past `len`.
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Single-use handle to rewrite a previously encoded field.
///
/// Filling consumes the handle, so a hole can be rewritten at most once.
#[must_use = "a hole that is never filled keeps its provisional value"]
#[derive(Debug)]
pub struct Hole<T: Scalar> {
    offset: usize,
    endian: Endian,
    _field: PhantomData<T>,
}

impl<T: Scalar> Hole<T> {
    /// Absolute offset of the field this hole rewrites.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Rewrites the field with `value` using the same width and byte order it
    /// was encoded with. The cursor's own position is left untouched.
    pub fn fill(self, cursor: &mut WriteCursor<'_>, value: T) -> CodecResult<()> {
        cursor.buf.rewrite_at(self.offset, value, self.endian)
    }

    /// Same as [`Hole::fill`], for when only the buffer is at hand.
    pub fn fill_buffer(self, buf: &mut ByteBuffer, value: T) -> CodecResult<()> {
        buf.rewrite_at(self.offset, value, self.endian)
    }
}

macro_rules! write_methods {
    ($($name:ident => $t:ty, $endian:expr;)*) => {
        $(
            #[doc = concat!("Encodes a `", stringify!($t), "` and advances past it.")]
            pub fn $name(&mut self, value: $t) -> CodecResult<()> {
                self.encode(value, $endian)
            }
        )*
    };
}

macro_rules! hole_methods {
    ($($name:ident => $t:ty, $endian:expr;)*) => {
        $(
            #[doc = concat!("Encodes a provisional `", stringify!($t), "` and returns its hole.")]
            pub fn $name(self, provisional: $t) -> CodecResult<Hole<$t>> {
                self.cursor.hole_of(provisional, $endian)
            }
        )*
    };
}

macro_rules! read_methods {
    ($($name:ident, $peek:ident => $t:ty, $endian:expr;)*) => {
        $(
            #[doc = concat!("Decodes a `", stringify!($t), "` and advances past it.")]
            pub fn $name(&mut self) -> CodecResult<$t> {
                self.decode($endian)
            }

            #[doc = concat!("Reads a `", stringify!($t), "` without advancing.")]
            pub fn $peek(&self) -> CodecResult<$t> {
                self.peek($endian)
            }
        )*
    };
}

/// Write position over a [`ByteBuffer`].
#[derive(Debug)]
pub struct WriteCursor<'a> {
    buf: &'a mut ByteBuffer,
    offset: usize,
    window: Window,
}

impl<'a> WriteCursor<'a> {
    /// Creates a cursor at the start of `buf` with an unbounded window.
    pub fn new(buf: &'a mut ByteBuffer) -> Self {
        Self::at(buf, 0)
    }

    /// Creates a cursor positioned after the last written byte.
    pub fn append(buf: &'a mut ByteBuffer) -> Self {
        let offset = buf.len();
        Self::at(buf, offset)
    }

    /// Creates a cursor at an absolute offset.
    pub fn at(buf: &'a mut ByteBuffer, offset: usize) -> Self {
        Self {
            buf,
            offset,
            window: Window {
                lower: 0,
                upper: usize::MAX,
            },
        }
    }

    /// Current absolute offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current offset as a [`Position`] marker.
    pub fn position(&self) -> Position {
        Position(self.offset)
    }

    /// Moves to an absolute position.
    pub fn seek(&mut self, position: Position) {
        self.offset = position.0;
    }

    /// The buffer being written.
    pub fn buffer(&self) -> &ByteBuffer {
        self.buf
    }

    /// Active window as `(lower, upper)`.
    pub fn window(&self) -> (usize, usize) {
        (self.window.lower, self.window.upper)
    }

    /// Encodes any scalar with an explicit byte order.
    pub fn encode<T: Scalar>(&mut self, value: T, endian: Endian) -> CodecResult<()> {
        self.window.check(self.offset, T::WIDTH)?;
        let mut raw = [0u8; 16];
        value.put(&mut raw[..T::WIDTH], endian);
        self.buf.write_at(self.offset, &raw[..T::WIDTH]);
        self.offset += T::WIDTH;
        Ok(())
    }

    write_methods! {
        encode_u8 => u8, Endian::Little;
        encode_i8 => i8, Endian::Little;
        encode_u16_le => u16, Endian::Little;
        encode_u16_be => u16, Endian::Big;
        encode_i16_le => i16, Endian::Little;
        encode_i16_be => i16, Endian::Big;
        encode_u32_le => u32, Endian::Little;
        encode_u32_be => u32, Endian::Big;
        encode_i32_le => i32, Endian::Little;
        encode_i32_be => i32, Endian::Big;
        encode_u64_le => u64, Endian::Little;
        encode_u64_be => u64, Endian::Big;
        encode_i64_le => i64, Endian::Little;
        encode_i64_be => i64, Endian::Big;
        encode_u128_le => u128, Endian::Little;
    }

    /// Encodes a raw byte range.
    pub fn encode_bytes(&mut self, data: &[u8]) -> CodecResult<()> {
        self.window.check(self.offset, data.len())?;
        self.buf.write_at(self.offset, data);
        self.offset += data.len();
        Ok(())
    }

    /// Encodes `count` zero bytes.
    pub fn encode_zeros(&mut self, count: usize) -> CodecResult<()> {
        self.window.check(self.offset, count)?;
        let end = self.offset + count;
        if self.buf.len() < end {
            self.buf.bytes.resize(end, 0);
        } else {
            self.buf.bytes[self.offset..end].fill(0);
        }
        self.offset = end;
        Ok(())
    }

    /// Encodes `text` as UTF-16LE without a terminator. Returns the byte length.
    pub fn encode_utf16(&mut self, text: &str) -> CodecResult<usize> {
        let start = self.offset;
        for unit in text.encode_utf16() {
            self.encode_u16_le(unit)?;
        }
        Ok(self.offset - start)
    }

    /// Encodes a `u16` byte-length tag followed by `text` as UTF-16LE.
    pub fn encode_utf16_prefixed(&mut self, text: &str) -> CodecResult<()> {
        let length = self.hole().encode_u16_le(0)?;
        let written = self.encode_utf16(text)?;
        let written = u16::try_from(written)
            .map_err(|_| CodecError::bad_packet("string longer than 65535 bytes"))?;
        length.fill(self, written)
    }

    /// Starts a hole encode: the next field is written provisionally and a
    /// rewrite handle is returned.
    pub fn hole(&mut self) -> HoleWriter<'_, 'a> {
        HoleWriter { cursor: self }
    }

    fn hole_of<T: Scalar>(&mut self, provisional: T, endian: Endian) -> CodecResult<Hole<T>> {
        let offset = self.offset;
        self.encode(provisional, endian)?;
        Ok(Hole {
            offset,
            endian,
            _field: PhantomData,
        })
    }

    /// Runs `body` with the window narrowed to `[lower, upper)`, restoring the
    /// enclosing window afterwards. The narrowed window may not escape the
    /// enclosing one.
    pub fn with_window<R>(
        &mut self,
        lower: usize,
        upper: usize,
        body: impl FnOnce(&mut Self) -> CodecResult<R>,
    ) -> CodecResult<R> {
        let saved = self.window;
        self.window = saved.narrow(lower, upper)?;
        let result = body(self);
        self.window = saved;
        result
    }

    /// Runs `body` with the window narrowed to the next `len` bytes.
    pub fn scoped<R>(&mut self, len: usize, body: impl FnOnce(&mut Self) -> CodecResult<R>) -> CodecResult<R> {
        let lower = self.offset;
        let upper = lower
            .checked_add(len)
            .ok_or_else(|| CodecError::bad_packet("scope length overflows"))?;
        self.with_window(lower, upper, body)
    }

    /// Pads with zeros up to the next multiple of `n` relative to `base`.
    pub fn align(&mut self, base: Position, n: usize) -> CodecResult<()> {
        let pad = padding(self.offset.saturating_sub(base.0), n);
        self.encode_zeros(pad)
    }

    /// Drops buffer contents past the current offset.
    pub fn truncate(&mut self) {
        self.buf.truncate(self.offset);
    }
}

impl AddAssign<usize> for WriteCursor<'_> {
    fn add_assign(&mut self, rhs: usize) {
        self.offset += rhs;
    }
}

impl SubAssign<usize> for WriteCursor<'_> {
    fn sub_assign(&mut self, rhs: usize) {
        self.offset = self.offset.saturating_sub(rhs);
    }
}

/// Hole-encoding view of a [`WriteCursor`], returned by [`WriteCursor::hole`].
pub struct HoleWriter<'c, 'a> {
    cursor: &'c mut WriteCursor<'a>,
}

impl HoleWriter<'_, '_> {
    hole_methods! {
        encode_u8 => u8, Endian::Little;
        encode_u16_le => u16, Endian::Little;
        encode_u16_be => u16, Endian::Big;
        encode_u32_le => u32, Endian::Little;
        encode_u32_be => u32, Endian::Big;
        encode_u64_le => u64, Endian::Little;
        encode_u128_le => u128, Endian::Little;
    }
}

/// Read position over a borrowed byte slice.
#[derive(Debug, Clone, Copy)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    window: Window,
}

impl<'a> ReadCursor<'a> {
    /// Creates a cursor at offset 0 with the window covering all of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            window: Window {
                lower: 0,
                upper: buf.len(),
            },
        }
    }

    /// Current absolute offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current offset as a [`Position`] marker.
    pub fn position(&self) -> Position {
        Position(self.offset)
    }

    /// Moves to an absolute position.
    pub fn seek(&mut self, position: Position) {
        self.offset = position.0;
    }

    /// A copy of this cursor moved to an absolute position.
    pub fn at(&self, position: Position) -> Self {
        Self {
            offset: position.0,
            ..*self
        }
    }

    /// Active window as `(lower, upper)`.
    pub fn window(&self) -> (usize, usize) {
        (self.window.lower, self.window.upper)
    }

    /// Bytes left before the window's upper bound.
    pub fn remaining(&self) -> usize {
        self.window.upper.saturating_sub(self.offset)
    }

    /// The whole underlying slice.
    pub fn source(&self) -> &'a [u8] {
        self.buf
    }

    /// Decodes any scalar with an explicit byte order.
    pub fn decode<T: Scalar>(&mut self, endian: Endian) -> CodecResult<T> {
        let value = self.peek(endian)?;
        self.offset += T::WIDTH;
        Ok(value)
    }

    /// Reads any scalar at the current offset without advancing.
    pub fn peek<T: Scalar>(&self, endian: Endian) -> CodecResult<T> {
        self.window.check(self.offset, T::WIDTH)?;
        Ok(T::get(&self.buf[self.offset..self.offset + T::WIDTH], endian))
    }

    read_methods! {
        decode_u8, peek_u8 => u8, Endian::Little;
        decode_i8, peek_i8 => i8, Endian::Little;
        decode_u16_le, peek_u16_le => u16, Endian::Little;
        decode_u16_be, peek_u16_be => u16, Endian::Big;
        decode_i16_le, peek_i16_le => i16, Endian::Little;
        decode_i16_be, peek_i16_be => i16, Endian::Big;
        decode_u32_le, peek_u32_le => u32, Endian::Little;
        decode_u32_be, peek_u32_be => u32, Endian::Big;
        decode_i32_le, peek_i32_le => i32, Endian::Little;
        decode_i32_be, peek_i32_be => i32, Endian::Big;
        decode_u64_le, peek_u64_le => u64, Endian::Little;
        decode_u64_be, peek_u64_be => u64, Endian::Big;
        decode_i64_le, peek_i64_le => i64, Endian::Little;
        decode_i64_be, peek_i64_be => i64, Endian::Big;
        decode_u128_le, peek_u128_le => u128, Endian::Little;
    }

    /// Decodes `len` raw bytes.
    pub fn decode_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        self.window.check(self.offset, len)?;
        let slice = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Decodes a fixed-size byte array.
    pub fn decode_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.decode_bytes(N)?);
        Ok(out)
    }

    /// Skips `len` bytes after bounds-checking them.
    pub fn skip(&mut self, len: usize) -> CodecResult<()> {
        self.decode_bytes(len).map(|_| ())
    }

    /// Decodes `byte_len` bytes of UTF-16LE text.
    pub fn decode_utf16(&mut self, byte_len: usize) -> CodecResult<String> {
        let start = self.offset;
        if byte_len % 2 != 0 {
            return Err(CodecError::InvalidString { offset: start });
        }
        let raw = self.decode_bytes(byte_len)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| CodecError::InvalidString { offset: start })
    }

    /// Decodes a `u16` byte-length tag followed by UTF-16LE text.
    pub fn decode_utf16_prefixed(&mut self) -> CodecResult<String> {
        let len = self.decode_u16_le()? as usize;
        self.decode_utf16(len)
    }

    /// Runs `body` with the window narrowed to `[lower, upper)`.
    pub fn with_window<R>(
        &mut self,
        lower: usize,
        upper: usize,
        body: impl FnOnce(&mut Self) -> CodecResult<R>,
    ) -> CodecResult<R> {
        let saved = self.window;
        self.window = saved.narrow(lower, upper)?;
        let result = body(self);
        self.window = saved;
        result
    }

    /// Runs `body` with the window narrowed to the next `len` bytes.
    pub fn scoped<R>(&mut self, len: usize, body: impl FnOnce(&mut Self) -> CodecResult<R>) -> CodecResult<R> {
        let lower = self.offset;
        let upper = lower
            .checked_add(len)
            .ok_or_else(|| CodecError::bad_packet("scope length overflows"))?;
        self.with_window(lower, upper, body)
    }

    /// Advances to the next multiple of `n` relative to `base`.
    ///
    /// Padding that would run past the window is clamped at the upper bound:
    /// the final element of a list is not required to carry trailing padding.
    pub fn align(&mut self, base: Position, n: usize) -> CodecResult<()> {
        let pad = padding(self.offset.saturating_sub(base.0), n);
        self.offset = (self.offset + pad).min(self.window.upper.max(self.offset));
        Ok(())
    }
}

impl Add<usize> for ReadCursor<'_> {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self {
            offset: self.offset + rhs,
            ..self
        }
    }
}

impl<'a> Sub<ReadCursor<'a>> for ReadCursor<'a> {
    type Output = usize;

    fn sub(self, rhs: ReadCursor<'a>) -> usize {
        debug_assert!(std::ptr::eq(self.buf, rhs.buf), "cursors over different buffers");
        self.offset.saturating_sub(rhs.offset)
    }
}

impl AddAssign<usize> for ReadCursor<'_> {
    fn add_assign(&mut self, rhs: usize) {
        self.offset += rhs;
    }
}

impl SubAssign<usize> for ReadCursor<'_> {
    fn sub_assign(&mut self, rhs: usize) {
        self.offset = self.offset.saturating_sub(rhs);
    }
}

/// Bytes needed to pad `len` up to a multiple of `n`.
pub fn padding(len: usize, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    (n - len % n) % n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_u32_le_into_empty_buffer() {
        let mut buf = ByteBuffer::new();
        let mut cursor = WriteCursor::new(&mut buf);
        cursor.encode_u32_le(0x0102_0304).unwrap();
        assert_eq!(cursor.offset(), 4);
        assert_eq!(buf.as_slice(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_both_endiannesses() {
        let mut buf = ByteBuffer::new();
        let mut cursor = WriteCursor::new(&mut buf);
        cursor.encode_u16_be(0xABCD).unwrap();
        cursor.encode_i32_le(-2).unwrap();
        let mut reader = ReadCursor::new(buf.as_slice());
        assert_eq!(reader.decode_u16_be().unwrap(), 0xABCD);
        assert_eq!(reader.decode_i32_le().unwrap(), -2);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_hole_rewrite_leaves_cursor_alone() {
        let mut buf = ByteBuffer::new();
        let mut cursor = WriteCursor::new(&mut buf);
        let length = cursor.hole().encode_u16_le(0).unwrap();
        cursor.encode_bytes(&[0xEE; 10]).unwrap();
        length.fill(&mut cursor, 10).unwrap();
        assert_eq!(cursor.offset(), 12);
        assert_eq!(&buf.as_slice()[0..2], &[0x0A, 0x00]);
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn test_hole_survives_buffer_growth() {
        let mut buf = ByteBuffer::with_capacity(1);
        let mut cursor = WriteCursor::new(&mut buf);
        let hole = cursor.hole().encode_u64_le(0).unwrap();
        cursor.encode_bytes(&vec![1u8; 4096]).unwrap();
        hole.fill(&mut cursor, u64::MAX).unwrap();
        assert_eq!(&buf.as_slice()[0..8], &[0xFF; 8]);
    }

    #[test]
    fn test_window_bounds() {
        let data = [0u8; 32];
        let mut cursor = ReadCursor::new(&data);
        cursor
            .with_window(10, 20, |c| {
                c.seek(Position(18));
                let err = c.decode_bytes(5).unwrap_err();
                assert!(matches!(err, CodecError::BufferOverrun { bound: Bound::Upper, offset: 18, .. }));
                c.seek(Position(12));
                assert_eq!(c.decode_bytes(5).unwrap().len(), 5);
                c.seek(Position(8));
                let err = c.decode_u16_le().unwrap_err();
                assert!(matches!(err, CodecError::BufferOverrun { bound: Bound::Lower, .. }));
                Ok(())
            })
            .unwrap();
        assert_eq!(cursor.window(), (0, 32));
    }

    #[test]
    fn test_window_cannot_escape_enclosing() {
        let data = [0u8; 32];
        let mut cursor = ReadCursor::new(&data);
        let result = cursor.with_window(4, 8, |c| c.with_window(4, 16, |_| Ok(())));
        assert!(matches!(result, Err(CodecError::BufferOverrun { bound: Bound::Upper, .. })));
    }

    #[test]
    fn test_cursor_arithmetic() {
        let data = [0u8; 16];
        let start = ReadCursor::new(&data);
        let later = start + 6;
        assert_eq!(later.offset(), 6);
        assert_eq!(later - start, 6);
        let mut moving = later;
        moving += 4;
        moving -= 2;
        assert_eq!(moving.offset(), 8);
    }

    #[test]
    fn test_align_relative_to_base() {
        let mut buf = ByteBuffer::new();
        let mut cursor = WriteCursor::new(&mut buf);
        cursor.encode_u8(1).unwrap();
        let base = cursor.position();
        cursor.encode_u16_le(2).unwrap();
        cursor.align(base, 8).unwrap();
        assert_eq!(cursor.offset(), 9);
    }

    #[test]
    fn test_truncate_drops_scratch() {
        let mut buf = ByteBuffer::new();
        let mut cursor = WriteCursor::new(&mut buf);
        cursor.encode_u32_le(7).unwrap();
        let mark = cursor.position();
        cursor.encode_zeros(6).unwrap();
        cursor.seek(mark);
        cursor.truncate();
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_utf16_prefixed_roundtrip() {
        let mut buf = ByteBuffer::new();
        let mut cursor = WriteCursor::new(&mut buf);
        cursor.encode_utf16_prefixed("\\\\srv\\share").unwrap();
        let mut reader = ReadCursor::new(buf.as_slice());
        assert_eq!(reader.peek_u16_le().unwrap(), 22);
        assert_eq!(reader.decode_utf16_prefixed().unwrap(), "\\\\srv\\share");
    }

    #[test]
    fn test_odd_utf16_length_rejected() {
        let data = [0x41, 0x00, 0x42];
        let mut reader = ReadCursor::new(&data);
        assert!(matches!(reader.decode_utf16(3), Err(CodecError::InvalidString { offset: 0 })));
    }

    #[test]
    fn test_scoped_write_window() {
        let mut buf = ByteBuffer::new();
        let mut cursor = WriteCursor::new(&mut buf);
        let result = cursor.scoped(2, |c| c.encode_u32_le(1));
        assert!(matches!(result, Err(CodecError::BufferOverrun { bound: Bound::Upper, .. })));
        cursor.scoped(4, |c| c.encode_u32_le(1)).unwrap();
        assert_eq!(cursor.offset(), 4);
    }
}
