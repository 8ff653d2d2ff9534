use std::io::{Read, Write};
use std::mem::size_of;

use allocator_api2::alloc::{Allocator, Global};

use super::seq::{EmptyIn, SeqBuf};
use super::{read_exact, read_len, write_len, Archive, Plain};
#[cfg(target_endian = "little")]
use super::{load_plain, save_plain};
use crate::types::{RegionError, Result};

/// Elements reserved before the first element of a sequence is read.
const RESERVE_AHEAD: usize = 1024;

/// Replaces the contents of `dst` with a counted sequence. `dst` is left
/// empty when the stream is rejected part way.
fn load_sequence<T, R, S>(dst: &mut S, input: &mut R) -> Result<()>
where
    T: Archive,
    R: Read + ?Sized,
    S: SeqBuf<T>,
{
    dst.clear_items();
    let result = read_len(input).and_then(|len| {
        dst.reserve_items(len.min(RESERVE_AHEAD))?;
        T::load_seq(dst, len, input)
    });
    if result.is_err() {
        dst.clear_items();
    }
    result
}

macro_rules! primitive_archive {
    ($($ty:ty),+ $(,)?) => {$(
        // Fixed-width numbers have no padding and no invalid bit patterns.
        unsafe impl Plain for $ty {}

        impl Archive for $ty {
            fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
                out.write_all(&self.to_le_bytes())?;
                Ok(())
            }

            fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()> {
                let mut raw = [0u8; size_of::<$ty>()];
                read_exact(input, &mut raw)?;
                *self = <$ty>::from_le_bytes(raw);
                Ok(())
            }

            #[cfg(target_endian = "little")]
            fn save_seq<W: Write + ?Sized>(items: &[Self], out: &mut W) -> Result<()> {
                save_plain(items, out)
            }

            #[cfg(target_endian = "little")]
            fn load_seq<R, S>(dst: &mut S, len: usize, input: &mut R) -> Result<()>
            where
                R: Read + ?Sized,
                S: SeqBuf<Self> + ?Sized,
            {
                load_plain(dst, len, input)
            }
        }

        impl<A> EmptyIn<A> for $ty {
            fn empty_in(_alloc: &A) -> Self {
                0 as $ty
            }
        }
    )+};
}

primitive_archive!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Archive for bool {
    fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        out.write_all(&[u8::from(*self)])?;
        Ok(())
    }

    fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()> {
        let mut raw = [0u8; 1];
        read_exact(input, &mut raw)?;
        *self = match raw[0] {
            0 => false,
            1 => true,
            other => return Err(RegionError::Corrupt(format!("invalid bool byte {other:#04x}"))),
        };
        Ok(())
    }
}

impl<A> EmptyIn<A> for bool {
    fn empty_in(_alloc: &A) -> Self {
        false
    }
}

impl Archive for String {
    fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        write_len(out, self.len())?;
        out.write_all(self.as_bytes())?;
        Ok(())
    }

    fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()> {
        let len = read_len(input)?;
        let mut bytes = Vec::new();
        (&mut *input).take(len as u64).read_to_end(&mut bytes)?;
        if bytes.len() != len {
            return Err(RegionError::Corrupt(format!(
                "string declared {len} bytes, stream held {}",
                bytes.len()
            )));
        }
        *self = String::from_utf8(bytes)
            .map_err(|err| RegionError::Corrupt(format!("invalid UTF-8 in string: {err}")))?;
        Ok(())
    }
}

impl<A> EmptyIn<A> for String {
    fn empty_in(_alloc: &A) -> Self {
        String::new()
    }
}

impl<X: Archive, Y: Archive> Archive for (X, Y) {
    fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        self.0.save(out)?;
        self.1.save(out)
    }

    fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()> {
        self.0.load(input)?;
        self.1.load(input)
    }
}

impl<A, X: EmptyIn<A>, Y: EmptyIn<A>> EmptyIn<A> for (X, Y) {
    fn empty_in(alloc: &A) -> Self {
        (X::empty_in(alloc), Y::empty_in(alloc))
    }
}

impl<T: Archive + EmptyIn<Global>> Archive for Vec<T> {
    fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        write_len(out, self.len())?;
        T::save_seq(self, out)
    }

    fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()> {
        load_sequence::<T, _, _>(self, input)
    }
}

impl<A, T> EmptyIn<A> for Vec<T> {
    fn empty_in(_alloc: &A) -> Self {
        Vec::new()
    }
}

impl<T, A> Archive for allocator_api2::vec::Vec<T, A>
where
    T: Archive + EmptyIn<A>,
    A: Allocator + Clone,
{
    fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        write_len(out, self.len())?;
        T::save_seq(self, out)
    }

    fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()> {
        load_sequence::<T, _, _>(self, input)
    }
}

impl<T, A: Allocator + Clone> EmptyIn<A> for allocator_api2::vec::Vec<T, A> {
    fn empty_in(alloc: &A) -> Self {
        allocator_api2::vec::Vec::new_in(alloc.clone())
    }
}

/// Wrapper that keeps the per-element sequence path even for plain types.
///
/// `Vec<Elementwise<u32>>` writes exactly the bytes `Vec<u32>` writes, one
/// element at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Elementwise<T>(pub T);

impl<T: Archive> Archive for Elementwise<T> {
    fn save<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        self.0.save(out)
    }

    fn load<R: Read + ?Sized>(&mut self, input: &mut R) -> Result<()> {
        self.0.load(input)
    }
}

impl<A, T: EmptyIn<A>> EmptyIn<A> for Elementwise<T> {
    fn empty_in(alloc: &A) -> Self {
        Elementwise(T::empty_in(alloc))
    }
}
