use std::alloc::{self, Layout};
use std::io::{Error, ErrorKind, Result};
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::{fmt, ptr};

/// The smallest alignment handed out for DMA memory. Device contexts, the DCBAA, rings and the
/// event ring segment table all require 64 bytes or less.
pub const DMA_ALIGN: usize = 64;

/// A zero-initialized allocation that the host controller may read and write.
///
/// DMA memory is identity mapped on the targets this crate supports, so the physical address
/// handed to the controller is the virtual address of the allocation.
pub struct Dma<T: ?Sized> {
    virt: *mut T,
    layout: Layout,
}

unsafe impl<T: ?Sized + Send> Send for Dma<T> {}
unsafe impl<T: ?Sized + Sync> Sync for Dma<T> {}

fn alloc_zeroed(size: usize, align: usize) -> Result<(*mut u8, Layout)> {
    let layout = Layout::from_size_align(size.max(1), align.max(DMA_ALIGN))
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid DMA layout"))?
        .pad_to_align();

    let virt = unsafe { alloc::alloc_zeroed(layout) };
    if virt.is_null() {
        return Err(Error::new(ErrorKind::OutOfMemory, "DMA allocation failed"));
    }
    Ok((virt, layout))
}

impl<T> Dma<T> {
    pub fn new(value: T) -> Result<Self> {
        let this = Self::zeroed()?;
        Ok(unsafe {
            ptr::write(this.virt, MaybeUninit::new(value));
            this.assume_init()
        })
    }

    pub fn zeroed() -> Result<Dma<MaybeUninit<T>>> {
        let (virt, layout) = alloc_zeroed(mem::size_of::<T>(), mem::align_of::<T>())?;
        Ok(Dma {
            virt: virt as *mut MaybeUninit<T>,
            layout,
        })
    }
}

impl<T> Dma<MaybeUninit<T>> {
    pub unsafe fn assume_init(self) -> Dma<T> {
        let (virt, layout) = (self.virt, self.layout);
        mem::forget(self);
        Dma {
            virt: virt as *mut T,
            layout,
        }
    }
}

impl<T> Dma<[T]> {
    /// Creates a zeroed DMA buffer with a length only known at runtime.
    pub fn zeroed_slice(count: usize) -> Result<Dma<[MaybeUninit<T>]>> {
        let size = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "DMA slice too large"))?;
        let (virt, layout) = alloc_zeroed(size, mem::align_of::<T>())?;
        Ok(Dma {
            virt: ptr::slice_from_raw_parts_mut(virt as *mut MaybeUninit<T>, count),
            layout,
        })
    }
}

impl<T> Dma<[MaybeUninit<T>]> {
    pub unsafe fn assume_init(self) -> Dma<[T]> {
        let (virt, layout) = (self.virt, self.layout);
        mem::forget(self);
        Dma {
            virt: virt as *mut [T],
            layout,
        }
    }
}

impl Dma<[u8]> {
    /// Allocates a byte buffer holding a copy of `data`, used as a bounce buffer for transfers.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut this = unsafe { Self::zeroed_slice(data.len())?.assume_init() };
        this.copy_from_slice(data);
        Ok(this)
    }
}

impl<T: ?Sized> Dma<T> {
    pub fn physical(&self) -> usize {
        self.virt as *mut u8 as usize
    }
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl<T: ?Sized> Deref for Dma<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.virt }
    }
}

impl<T: ?Sized> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.virt }
    }
}

impl<T: ?Sized> fmt::Debug for Dma<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dma")
            .field("physical", &format_args!("{:#X}", self.physical()))
            .field("size", &self.size())
            .finish()
    }
}

impl<T: ?Sized> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.virt);
            alloc::dealloc(self.virt as *mut u8, self.layout);
        }
    }
}
