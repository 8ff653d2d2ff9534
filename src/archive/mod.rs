#![allow(unsafe_code)]
//! Save/load of region-resident containers over byte streams.
//!
//! A sequence is a little-endian `u64` element count followed by the
//! elements. Element types choose their sequence path through
//! [`Archive::save_seq`] and [`Archive::load_seq`]: the default replays
//! `save`/`load` per element, while [`Plain`] types copy the whole slice
//! as one byte range. Both paths produce the same bytes, so a stream
//! written by one can be read by the other.
//!
//! ```
//! use graphheap::archive;
//!
//! let edges: Vec<(u32, u32)> = vec![(0, 1), (1, 2)];
//! let mut buf = Vec::new();
//! archive::save(&mut buf, &edges).unwrap();
//! let mut back: Vec<(u32, u32)> = Vec::new();
//! archive::load(&mut buf.as_slice(), &mut back).unwrap();
//! assert_eq!(back, edges);
//! ```

mod impls;
mod seq;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem::{size_of, size_of_val, MaybeUninit};
use std::path::Path;

use tracing::debug;

use crate::types::{RegionError, Result};

pub use impls::Elementwise;
pub use seq::{EmptyIn, SeqBuf};

/// Longest sequence a stream may declare.
pub const MAX_SEQ_LEN: u64 = 1 << 40;

/// Bytes copied per step when loading a plain sequence.
const BULK_CHUNK_BYTES: usize = 64 * 1024;

/// A value that can be written to and read back from a byte stream.
pub trait Archive: Sized {
    /// Writes `self`.
    fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()>;

    /// Overwrites `self` with a value read from `input`.
    fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()>;

    /// Writes the elements of a sequence, without the count.
    fn save_seq<W: Write + ?Sized>(items: &[Self], out: &mut W) -> Result<()> {
        for item in items {
            item.save(out)?;
        }
        Ok(())
    }

    /// Appends `len` elements read from `input` to `dst`.
    fn load_seq<R, S>(dst: &mut S, len: usize, input: &mut R) -> Result<()>
    where
        R: Read + ?Sized,
        S: SeqBuf<Self> + ?Sized,
    {
        for _ in 0..len {
            let mut item = dst.blank();
            item.load(input)?;
            dst.push_item(item)?;
        }
        Ok(())
    }
}

/// Marker for types whose in-memory bytes are their serialized form.
///
/// # Safety
///
/// Implementors must be `Copy`, contain no padding bytes and no pointers,
/// and accept every bit pattern as a valid value.
pub unsafe trait Plain: Copy + 'static {}

/// Writes `value` to `out`.
pub fn save<W: Write + ?Sized, T: Archive>(out: &mut W, value: &T) -> Result<()> {
    value.save(out)
}

/// Reads `value` from `input`.
pub fn load<R: Read + ?Sized, T: Archive>(input: &mut R, value: &mut T) -> Result<()> {
    value.load(input)
}

/// Writes `value` to a new file at `path`.
pub fn save_to_file<T: Archive>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    value.save(&mut out)?;
    out.flush()?;
    out.get_ref().sync_all()?;
    debug!(path = %path.display(), "archive.save_to_file");
    Ok(())
}

/// Reads `value` from the file at `path`.
pub fn load_from_file<T: Archive>(path: impl AsRef<Path>, value: &mut T) -> Result<()> {
    let path = path.as_ref();
    let mut input = BufReader::new(File::open(path)?);
    value.load(&mut input)?;
    debug!(path = %path.display(), "archive.load_from_file");
    Ok(())
}

/// Writes a sequence count.
pub fn write_len<W: Write + ?Sized>(out: &mut W, len: usize) -> Result<()> {
    out.write_all(&(len as u64).to_le_bytes())?;
    Ok(())
}

/// Reads a sequence count and rejects anything above [`MAX_SEQ_LEN`].
pub fn read_len<R: Read + ?Sized>(input: &mut R) -> Result<usize> {
    let mut raw = [0u8; 8];
    read_exact(input, &mut raw)?;
    let len = u64::from_le_bytes(raw);
    if len > MAX_SEQ_LEN {
        return Err(RegionError::Corrupt(format!(
            "sequence length {len} exceeds limit {MAX_SEQ_LEN}"
        )));
    }
    usize::try_from(len)
        .map_err(|_| RegionError::Corrupt(format!("sequence length {len} exceeds address space")))
}

/// `read_exact` that reports a short stream as corruption.
pub(crate) fn read_exact<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => {
            RegionError::Corrupt(format!("stream ended {} bytes early", buf.len()))
        }
        _ => RegionError::Io(err),
    })
}

/// Writes a slice of plain values as one byte range.
#[doc(hidden)]
pub fn save_plain<T: Plain, W: Write + ?Sized>(items: &[T], out: &mut W) -> Result<()> {
    // `Plain` types have no padding, so every byte is initialized.
    let bytes = unsafe { std::slice::from_raw_parts(items.as_ptr() as *const u8, size_of_val(items)) };
    out.write_all(bytes)?;
    Ok(())
}

/// Reads one plain value in place.
#[doc(hidden)]
pub fn load_plain_into<T: Plain, R: Read + ?Sized>(value: &mut T, input: &mut R) -> Result<()> {
    // Any bit pattern is a valid `T`.
    let bytes = unsafe { std::slice::from_raw_parts_mut(value as *mut T as *mut u8, size_of::<T>()) };
    read_exact(input, bytes)
}

/// Appends `len` plain values read as raw bytes, one chunk at a time so a
/// lying count cannot reserve more than the stream delivers.
#[doc(hidden)]
pub fn load_plain<T, R, S>(dst: &mut S, len: usize, input: &mut R) -> Result<()>
where
    T: Plain,
    R: Read + ?Sized,
    S: SeqBuf<T> + ?Sized,
{
    if size_of::<T>() == 0 {
        for _ in 0..len {
            dst.push_item(zeroed_plain())?;
        }
        return Ok(());
    }
    let chunk = (BULK_CHUNK_BYTES / size_of::<T>()).max(1);
    let mut remaining = len;
    while remaining > 0 {
        let step = remaining.min(chunk);
        dst.reserve_items(step)?;
        let spare: &mut [MaybeUninit<T>] = &mut dst.spare_items()[..step];
        let byte_len = step * size_of::<T>();
        let bytes = unsafe {
            let raw = spare.as_mut_ptr() as *mut u8;
            std::ptr::write_bytes(raw, 0, byte_len);
            std::slice::from_raw_parts_mut(raw, byte_len)
        };
        read_exact(input, bytes)?;
        // The `step` slots were just filled with valid `T`s.
        unsafe { dst.commit_items(step) };
        remaining -= step;
    }
    Ok(())
}

/// All-zero value of a plain type.
#[doc(hidden)]
pub fn zeroed_plain<T: Plain>() -> T {
    // Zero is a valid bit pattern for every `Plain` type.
    unsafe { std::mem::zeroed() }
}

/// Makes a `Copy` type with no padding serialize as its raw bytes, and
/// gives sequences of it the bulk path.
///
/// ```
/// #[derive(Clone, Copy, Debug, PartialEq)]
/// #[repr(C)]
/// struct Edge {
///     src: u32,
///     dst: u32,
///     weight: f32,
/// }
/// graphheap::plain_archive!(Edge);
///
/// let edges = vec![Edge { src: 0, dst: 1, weight: 0.5 }];
/// let mut buf = Vec::new();
/// graphheap::archive::save(&mut buf, &edges).unwrap();
/// assert_eq!(buf.len(), 8 + 12);
/// ```
///
/// The type must have no padding, hold no pointers, and accept any bit
/// pattern.
#[macro_export]
macro_rules! plain_archive {
    ($($ty:ty),+ $(,)?) => {$(
        #[allow(unsafe_code)]
        unsafe impl $crate::archive::Plain for $ty {}

        impl $crate::archive::Archive for $ty {
            fn save<W: ::std::io::Write + ?Sized>(&self, out: &mut W) -> $crate::Result<()> {
                $crate::archive::save_plain(::std::slice::from_ref(self), out)
            }

            fn load<R: ::std::io::Read + ?Sized>(&mut self, input: &mut R) -> $crate::Result<()> {
                $crate::archive::load_plain_into(self, input)
            }

            fn save_seq<W: ::std::io::Write + ?Sized>(
                items: &[Self],
                out: &mut W,
            ) -> $crate::Result<()> {
                $crate::archive::save_plain(items, out)
            }

            fn load_seq<R, S>(dst: &mut S, len: usize, input: &mut R) -> $crate::Result<()>
            where
                R: ::std::io::Read + ?Sized,
                S: $crate::archive::SeqBuf<Self> + ?Sized,
            {
                $crate::archive::load_plain(dst, len, input)
            }
        }

        impl<A> $crate::archive::EmptyIn<A> for $ty {
            fn empty_in(_alloc: &A) -> Self {
                $crate::archive::zeroed_plain()
            }
        }
    )+};
}
