use std::{
    alloc::{handle_alloc_error, Allocator, Global, Layout},
    mem::{align_of, needs_drop, size_of},
    ptr::NonNull,
};

/// Allocation convention for heap arrays handed around as bare element
/// pointers.
///
/// Raw allocation does not tell generic code how many elements live in a
/// block, so adapters record the count themselves in a hidden *cookie*
/// placed just before the first element. The adapter is the single seam to
/// swap for a different bookkeeping convention; the array policies never
/// touch the block layout directly.
///
/// # Safety
/// `allocate` must return a pointer whose cookie (when `cookie_len` is
/// non-zero) holds exactly `n`, such that `element_count` reads it back and
/// `deallocate` releases the whole block including the cookie.
pub unsafe trait Abi {
    /// Length in bytes of the cookie kept for element type `T`.
    fn cookie_len<T>() -> usize;

    /// Allocate a block for `n` elements of `T`, recording `n` in the
    /// cookie when one is kept, and return a pointer to the first element.
    ///
    /// No elements are constructed. Diverges via
    /// [`handle_alloc_error`] if the underlying allocation fails.
    fn allocate<T>(n: usize) -> NonNull<T>;

    /// Read back the element count recorded by [`Abi::allocate`].
    ///
    /// # Safety
    /// `p` must come from `Self::allocate::<T>` and must still be live.
    /// Element types without a cookie are rejected at compile time.
    unsafe fn element_count<T>(p: NonNull<T>) -> usize;

    /// Release a block obtained from [`Abi::allocate`], cookie included.
    ///
    /// No element destructors are run.
    ///
    /// # Safety
    /// `p` must come from `Self::allocate::<T>` and must not be used again.
    unsafe fn deallocate<T>(p: NonNull<T>);
}

fn block_layout<T>(cookie: usize, n: usize) -> Layout {
    let bytes = size_of::<T>()
        .checked_mul(n)
        .and_then(|b| b.checked_add(cookie))
        .expect("array block size overflows usize");
    let align = align_of::<T>().max(align_of::<usize>());
    Layout::from_size_align(bytes, align).expect("array block size overflows isize")
}

fn allocate_block<T>(cookie: usize, n: usize) -> NonNull<T> {
    let layout = block_layout::<T>(cookie, n);
    let Ok(block) = Global.allocate(layout) else {
        handle_alloc_error(layout)
    };
    let first = unsafe { block.cast::<u8>().as_ptr().add(cookie) }.cast::<T>();
    if cookie != 0 {
        unsafe { first.cast::<usize>().sub(1).write(n) };
    }
    unsafe { NonNull::new_unchecked(first) }
}

unsafe fn deallocate_block<T>(cookie: usize, n: usize, p: NonNull<T>) {
    let layout = block_layout::<T>(cookie, n);
    let block = unsafe { p.as_ptr().cast::<u8>().sub(cookie) };
    unsafe { Global.deallocate(NonNull::new_unchecked(block), layout) };
}

/// The Itanium C++ ABI array-cookie convention.
///
/// A cookie of `max(size_of::<usize>(), align_of::<T>())` bytes is kept
/// only when `T` needs dropping, so the count slot sits right below the
/// first element and the element keeps its natural alignment. Rust's
/// allocator needs the block layout back at release time, which only the
/// cookie can supply, so [`Abi::element_count`] and [`Abi::deallocate`]
/// are restricted to `needs_drop` element types; arrays of trivially
/// droppable elements go through [`Counted`] instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Itanium;

unsafe impl Abi for Itanium {
    fn cookie_len<T>() -> usize {
        if needs_drop::<T>() {
            size_of::<usize>().max(align_of::<T>())
        } else {
            0
        }
    }

    fn allocate<T>(n: usize) -> NonNull<T> {
        allocate_block(Self::cookie_len::<T>(), n)
    }

    unsafe fn element_count<T>(p: NonNull<T>) -> usize {
        const {
            assert!(
                needs_drop::<T>(),
                "no cookie is kept for trivially droppable elements; use the Counted adapter"
            )
        };
        unsafe { p.as_ptr().cast::<usize>().sub(1).read() }
    }

    unsafe fn deallocate<T>(p: NonNull<T>) {
        let n = unsafe { Self::element_count(p) };
        unsafe { deallocate_block(Self::cookie_len::<T>(), n, p) };
    }
}

/// A self-contained convention that always keeps the cookie.
///
/// Costs a few bytes per array of trivially droppable elements, in exchange
/// for supporting every element type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counted;

unsafe impl Abi for Counted {
    fn cookie_len<T>() -> usize {
        size_of::<usize>().max(align_of::<T>())
    }

    fn allocate<T>(n: usize) -> NonNull<T> {
        allocate_block(Self::cookie_len::<T>(), n)
    }

    unsafe fn element_count<T>(p: NonNull<T>) -> usize {
        unsafe { p.as_ptr().cast::<usize>().sub(1).read() }
    }

    unsafe fn deallocate<T>(p: NonNull<T>) {
        let n = unsafe { Self::element_count(p) };
        unsafe { deallocate_block(Self::cookie_len::<T>(), n, p) };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn count_round_trip() {
        let p = Itanium::allocate::<String>(3);
        unsafe {
            for i in 0..3 {
                p.as_ptr().add(i).write(i.to_string());
            }
            assert_eq!(Itanium::element_count(p), 3);
            for i in (0..3).rev() {
                std::ptr::drop_in_place(p.as_ptr().add(i));
            }
            Itanium::deallocate(p);
        }
    }

    #[test]
    fn zero_len() {
        let p = Itanium::allocate::<String>(0);
        unsafe {
            assert_eq!(Itanium::element_count(p), 0);
            Itanium::deallocate(p);
        }
    }

    #[test]
    fn over_aligned() {
        #[repr(align(32))]
        struct Wide(#[allow(dead_code)] String);

        assert_eq!(Itanium::cookie_len::<Wide>(), 32);
        let p = Itanium::allocate::<Wide>(2);
        assert_eq!(p.as_ptr() as usize % 32, 0);
        unsafe {
            p.as_ptr().write(Wide(String::from("a")));
            p.as_ptr().add(1).write(Wide(String::from("b")));
            assert_eq!(Itanium::element_count(p), 2);
            std::ptr::drop_in_place(p.as_ptr().add(1));
            std::ptr::drop_in_place(p.as_ptr());
            Itanium::deallocate(p);
        }
    }

    #[test]
    fn trivial_elements_have_no_cookie() {
        assert_eq!(Itanium::cookie_len::<u64>(), 0);
        assert_eq!(Itanium::cookie_len::<String>(), size_of::<usize>());
    }

    #[test]
    fn overflowing_block_size_panics() {
        let huge = usize::MAX / size_of::<String>() + 1;
        assert!(catch_unwind(|| Itanium::allocate::<String>(huge)).is_err());
        assert!(catch_unwind(|| Counted::allocate::<u64>(usize::MAX / 4)).is_err());
    }

    #[test]
    fn counted_takes_trivial_elements() {
        let p = Counted::allocate::<u32>(5);
        unsafe {
            for i in 0..5u32 {
                p.as_ptr().add(i as usize).write(i);
            }
            assert_eq!(Counted::element_count(p), 5);
            assert_eq!(p.as_ptr().add(4).read(), 4);
            Counted::deallocate(p);
        }
    }
}
