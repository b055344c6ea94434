use crate::{
    abi::{Abi, Itanium},
    CloneSelf,
};
use std::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
};

/// Produces an independently owned replica of a pointee.
///
/// Stateless policies implement this as zero-sized types; stateful ones
/// (e.g. [`ReplicateWith`]) carry their state by value. A replicator never
/// sees a null pointer: the handle maps empty to empty itself.
pub trait Replicate<T: ?Sized> {
    /// Replicate the pointee behind `p`.
    ///
    /// # Safety
    /// `p` must point to a live `T` this replicator understands; for array
    /// replicators that means the first element of a block allocated
    /// through the matching [`Abi`] adapter.
    unsafe fn replicate(&self, p: NonNull<T>) -> NonNull<T>;
}

/// Releases a pointee and the storage behind it.
pub trait Destroy<T: ?Sized> {
    /// Destroy the pointee behind `p` and free its block.
    ///
    /// # Safety
    /// `p` must point to a live `T` allocated the way this destroyer
    /// expects, and must not be used afterwards.
    unsafe fn destroy(&self, p: NonNull<T>);
}

/// Marker for replicators whose replicas are lone boxed objects, releasable
/// by [`DefaultDestroy`].
///
/// # Safety
/// `replicate` must return a pointer valid for `Box::from_raw`.
pub unsafe trait ObjectReplicate<T: ?Sized>: Replicate<T> {}

/// Marker for replicators whose replicas are cookie-tracked arrays laid out
/// by the adapter `A`, releasable by [`ArrayDestroy<T, A>`].
///
/// # Safety
/// `replicate` must return the first element of a block obtained from
/// `A::allocate`, with every element initialized.
pub unsafe trait ArrayReplicate<T, A: Abi>: Replicate<T> {}

macro_rules! stateless_policy {
    ($(#[$attr:meta])* $name:ident<T: ?Sized>) => {
        $(#[$attr])*
        pub struct $name<T: ?Sized>(PhantomData<fn(&T)>);

        stateless_policy!(@impls $name, (T: ?Sized), (T));
    };
    ($(#[$attr:meta])* $name:ident<T, A>) => {
        $(#[$attr])*
        pub struct $name<T, A = Itanium>(PhantomData<(fn(&T), fn() -> A)>);

        stateless_policy!(@impls $name, (T, A), (T, A));
    };
    (@impls $name:ident, ($($decl:tt)*), ($($use:tt)*)) => {
        impl<$($decl)*> $name<$($use)*> {
            /// Create the policy object.
            pub const fn new() -> Self {
                Self(PhantomData)
            }
        }

        impl<$($decl)*> Default for $name<$($use)*> {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<$($decl)*> Clone for $name<$($use)*> {
            fn clone(&self) -> Self {
                Self::new()
            }
        }

        impl<$($decl)*> Copy for $name<$($use)*> {}

        impl<$($decl)*> fmt::Debug for $name<$($use)*> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

stateless_policy! {
    /// Replicates through the pointee's [`Clone`] impl.
    ///
    /// Only available for sized pointees: a `dyn` pointee replicated
    /// through its statically known type would lose the rest of the
    /// concrete object, so trait objects must use [`DefaultClone`]. That
    /// substitution is enforced by the trait bounds, not at run time.
    DefaultCopy<T: ?Sized>
}

stateless_policy! {
    /// Replicates through the pointee's [`CloneSelf`] capability, which
    /// dispatches to the concrete runtime type.
    DefaultClone<T: ?Sized>
}

stateless_policy! {
    /// Releases a lone boxed pointee.
    DefaultDestroy<T: ?Sized>
}

stateless_policy! {
    /// Replicates a cookie-tracked array element by element through
    /// [`Clone`].
    ArrayCopy<T, A>
}

stateless_policy! {
    /// Replicates a cookie-tracked array element by element through the
    /// placement form of [`CloneSelf`].
    ArrayClone<T, A>
}

stateless_policy! {
    /// Drops every element of a cookie-tracked array, last first, then
    /// releases the block.
    ArrayDestroy<T, A>
}

impl<T: Clone> Replicate<T> for DefaultCopy<T> {
    unsafe fn replicate(&self, p: NonNull<T>) -> NonNull<T> {
        NonNull::from(Box::leak(Box::new(unsafe { p.as_ref() }.clone())))
    }
}

unsafe impl<T: Clone> ObjectReplicate<T> for DefaultCopy<T> {}

impl<T: ?Sized + CloneSelf> Replicate<T> for DefaultClone<T> {
    unsafe fn replicate(&self, p: NonNull<T>) -> NonNull<T> {
        let data = unsafe { p.as_ref() }.clone_self();
        let (_, metadata) = p.as_ptr().to_raw_parts();
        // The replica is the same concrete type, so the source metadata
        // (vtable for a `dyn` pointee) fits it.
        unsafe { NonNull::new_unchecked(ptr::from_raw_parts_mut(data.as_ptr(), metadata)) }
    }
}

unsafe impl<T: ?Sized + CloneSelf> ObjectReplicate<T> for DefaultClone<T> {}

impl<T: ?Sized> Destroy<T> for DefaultDestroy<T> {
    unsafe fn destroy(&self, p: NonNull<T>) {
        drop(unsafe { Box::from_raw(p.as_ptr()) });
    }
}

/// Elements `[0, live)` of a cookie block, dropped in descending order and
/// the block released when the guard goes.
///
/// This is what keeps partial array operations from leaking: a panic
/// mid-build or mid-teardown unwinds through the guard, which finishes the
/// element drops and frees the block before the panic continues. A second
/// panic inside the guard aborts the process.
struct LiveBlock<T, A: Abi> {
    first: NonNull<T>,
    live: usize,
    _abi: PhantomData<fn() -> A>,
}

impl<T, A: Abi> Drop for LiveBlock<T, A> {
    fn drop(&mut self) {
        unsafe {
            while self.live > 0 {
                self.live -= 1;
                ptr::drop_in_place(self.first.as_ptr().add(self.live));
            }
            A::deallocate(self.first);
        }
    }
}

/// Allocate an `n`-element block through `A` and initialize every slot in
/// ascending order with `fill`.
pub(crate) fn fill_array<T, A: Abi>(n: usize, mut fill: impl FnMut(usize, *mut T)) -> NonNull<T> {
    let first = A::allocate::<T>(n);
    let mut guard = LiveBlock::<T, A> {
        first,
        live: 0,
        _abi: PhantomData,
    };
    while guard.live < n {
        fill(guard.live, unsafe { first.as_ptr().add(guard.live) });
        guard.live += 1;
    }
    mem::forget(guard);
    first
}

impl<T: Clone, A: Abi> Replicate<T> for ArrayCopy<T, A> {
    unsafe fn replicate(&self, p: NonNull<T>) -> NonNull<T> {
        let n = unsafe { A::element_count(p) };
        fill_array::<T, A>(n, |i, slot| unsafe {
            slot.write((*p.as_ptr().add(i)).clone());
        })
    }
}

unsafe impl<T: Clone, A: Abi> ArrayReplicate<T, A> for ArrayCopy<T, A> {}

impl<T: CloneSelf, A: Abi> Replicate<T> for ArrayClone<T, A> {
    unsafe fn replicate(&self, p: NonNull<T>) -> NonNull<T> {
        let n = unsafe { A::element_count(p) };
        fill_array::<T, A>(n, |i, slot| unsafe {
            (*p.as_ptr().add(i)).clone_to(slot.cast());
        })
    }
}

unsafe impl<T: CloneSelf, A: Abi> ArrayReplicate<T, A> for ArrayClone<T, A> {}

impl<T, A: Abi> Destroy<T> for ArrayDestroy<T, A> {
    unsafe fn destroy(&self, p: NonNull<T>) {
        let n = unsafe { A::element_count(p) };
        let mut guard = LiveBlock::<T, A> {
            first: p,
            live: n,
            _abi: PhantomData,
        };
        while guard.live > 0 {
            guard.live -= 1;
            unsafe { ptr::drop_in_place(p.as_ptr().add(guard.live)) };
        }
        // Guard drop releases the block; if an element drop panicked above
        // it also finishes the remaining drops first.
    }
}

/// Stateful replicator built from a closure.
///
/// Pair it with a destroyer that understands the closure's allocation
/// through [`ValuePtr::from_raw_in`](crate::ValuePtr::from_raw_in).
#[derive(Clone)]
pub struct ReplicateWith<F>(pub F);

impl<T: ?Sized, F: Fn(NonNull<T>) -> NonNull<T>> Replicate<T> for ReplicateWith<F> {
    unsafe fn replicate(&self, p: NonNull<T>) -> NonNull<T> {
        (self.0)(p)
    }
}

/// Stateful destroyer built from a closure, the custom-deleter case.
#[derive(Clone)]
pub struct DestroyWith<F>(pub F);

impl<T: ?Sized, F: Fn(NonNull<T>)> Destroy<T> for DestroyWith<F> {
    unsafe fn destroy(&self, p: NonNull<T>) {
        (self.0)(p)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{panic::catch_unwind, sync::Arc};

    #[test]
    fn copy_policy_round_trip() {
        let data = Arc::new(());
        let source = Box::new(data.clone());
        let source = NonNull::from(Box::leak(source));

        let replica = unsafe { DefaultCopy::new().replicate(source) };
        assert_eq!(Arc::strong_count(&data), 3);
        assert_ne!(replica, source);

        unsafe {
            DefaultDestroy::new().destroy(replica);
            DefaultDestroy::new().destroy(source);
        }
        assert_eq!(Arc::strong_count(&data), 1);
    }

    #[test]
    fn array_policy_round_trip() {
        let data = Arc::new(());
        let source = fill_array::<Arc<()>, Itanium>(4, |_, slot| unsafe {
            slot.write(data.clone());
        });
        assert_eq!(Arc::strong_count(&data), 5);

        let replica = unsafe { ArrayCopy::<Arc<()>>::new().replicate(source) };
        assert_eq!(unsafe { Itanium::element_count(replica) }, 4);
        assert_eq!(Arc::strong_count(&data), 9);

        unsafe {
            ArrayDestroy::<Arc<()>>::new().destroy(replica);
            ArrayDestroy::<Arc<()>>::new().destroy(source);
        }
        assert_eq!(Arc::strong_count(&data), 1);
    }

    struct Fused {
        _token: Arc<()>,
        fused: bool,
    }

    impl Clone for Fused {
        fn clone(&self) -> Self {
            if self.fused {
                panic!("fuse blown");
            }
            Self {
                _token: self._token.clone(),
                fused: false,
            }
        }
    }

    #[test]
    fn partial_build_rolls_back() {
        let data = Arc::new(());
        let source = fill_array::<Fused, Itanium>(5, |i, slot| unsafe {
            slot.write(Fused {
                _token: data.clone(),
                fused: i == 3,
            });
        });
        assert_eq!(Arc::strong_count(&data), 6);

        // The fourth element refuses to clone; the three already built must
        // be dropped and the new block freed before the panic surfaces.
        let result = catch_unwind(|| unsafe { ArrayCopy::<Fused>::new().replicate(source) });
        assert!(result.is_err());
        assert_eq!(Arc::strong_count(&data), 6);

        unsafe { ArrayDestroy::<Fused>::new().destroy(source) };
        assert_eq!(Arc::strong_count(&data), 1);
    }

    struct NoisyDrop {
        _token: Arc<()>,
        noisy: bool,
    }

    impl Drop for NoisyDrop {
        fn drop(&mut self) {
            if self.noisy {
                panic!("drop failed");
            }
        }
    }

    #[test]
    fn teardown_finishes_past_a_panicking_drop() {
        let data = Arc::new(());
        // Destruction runs last-to-first, so index 4 panics first and the
        // remaining four must still be dropped.
        let source = fill_array::<NoisyDrop, Itanium>(5, |i, slot| unsafe {
            slot.write(NoisyDrop {
                _token: data.clone(),
                noisy: i == 4,
            });
        });
        assert_eq!(Arc::strong_count(&data), 6);

        let result = catch_unwind(|| unsafe { ArrayDestroy::<NoisyDrop>::new().destroy(source) });
        assert!(result.is_err());
        assert_eq!(Arc::strong_count(&data), 1);
    }

    #[test]
    fn custom_deleter() {
        let data = Arc::new(());
        let p = NonNull::from(Box::leak(Box::new(data.clone())));
        let deleter = DestroyWith(|p: NonNull<Arc<()>>| unsafe {
            drop(Box::from_raw(p.as_ptr()));
        });
        unsafe { deleter.destroy(p) };
        assert_eq!(Arc::strong_count(&data), 1);
    }
}
