use core::{
    cmp::PartialEq,
    fmt,
    mem::MaybeUninit,
    ops::{BitAnd, BitOr, Not},
    ptr,
};

/// IO abstraction
pub trait Io {
    /// Value type for IO, usually some unsigned number
    type Value: Copy
        + PartialEq
        + BitAnd<Output = Self::Value>
        + BitOr<Output = Self::Value>
        + Not<Output = Self::Value>;

    /// Read the underlying value
    fn read(&self) -> Self::Value;
    /// Write the underlying value
    fn write(&mut self, value: Self::Value);

    /// Check whether the underlying value contains bit flags
    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        (self.read() & flags) == flags
    }

    /// Enable or disable specific bit flags
    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let tmp: Self::Value = match value {
            true => self.read() | flags,
            false => self.read() & !flags,
        };
        self.write(tmp);
    }
}

/// A memory mapped register, or a field of a DMA structure shared with a device.
///
/// Every access is volatile, and the stored representation is always little endian, which is
/// what the host controller expects regardless of the CPU byte order.
#[repr(transparent)]
pub struct Mmio<T> {
    value: MaybeUninit<T>,
}

impl<T> Mmio<T> {
    /// Creates a register holding `value` in device byte order. Only useful for values that live
    /// in ordinary memory, such as copies of DMA records.
    pub const fn from_raw(value: T) -> Self {
        Self {
            value: MaybeUninit::new(value),
        }
    }
}

macro_rules! mmio_le {
    ($($ty:ty),*) => {
        $(
            impl Io for Mmio<$ty> {
                type Value = $ty;

                #[inline(always)]
                fn read(&self) -> $ty {
                    unsafe { <$ty>::from_le(ptr::read_volatile(self.value.as_ptr())) }
                }

                #[inline(always)]
                fn write(&mut self, value: $ty) {
                    unsafe { ptr::write_volatile(self.value.as_mut_ptr(), value.to_le()) }
                }
            }

            impl Clone for Mmio<$ty> {
                fn clone(&self) -> Self {
                    Self::from_raw(unsafe { ptr::read_volatile(self.value.as_ptr()) })
                }
            }

            impl Default for Mmio<$ty> {
                fn default() -> Self {
                    Self::from_raw(0)
                }
            }

            impl fmt::Debug for Mmio<$ty> {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{:#X}", self.read())
                }
            }
        )*
    };
}

mmio_le!(u8, u16, u32, u64);

/// Read-only IO
#[repr(transparent)]
pub struct ReadOnly<I> {
    inner: I,
}

impl<I: Io> ReadOnly<I> {
    /// Wraps IO
    pub const fn new(inner: I) -> ReadOnly<I> {
        ReadOnly { inner }
    }

    /// Calls [Io::read]
    #[inline(always)]
    pub fn read(&self) -> I::Value {
        self.inner.read()
    }

    /// Calls [Io::readf]
    #[inline(always)]
    pub fn readf(&self, flags: I::Value) -> bool {
        self.inner.readf(flags)
    }
}

/// Write-only IO, such as a doorbell.
#[repr(transparent)]
pub struct WriteOnly<I> {
    inner: I,
}

impl<I: Io> WriteOnly<I> {
    /// Wraps IO
    pub const fn new(inner: I) -> WriteOnly<I> {
        WriteOnly { inner }
    }

    /// Calls [Io::write]
    #[inline(always)]
    pub fn write(&mut self, value: I::Value) {
        self.inner.write(value)
    }
}
