use crate::{
    abi::{Abi, Itanium},
    handler::{
        fill_array, ArrayClone, ArrayCopy, ArrayDestroy, ArrayReplicate, DefaultClone,
        DefaultCopy, DefaultDestroy, Destroy, ObjectReplicate, Replicate,
    },
};
use std::{
    cmp::Ordering,
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::{Deref, DerefMut, Index, IndexMut},
    ptr::{self, NonNull},
    rc::{self, Rc},
    slice,
    sync::{self, Arc},
};

/// A single-owner heap pointer with value semantics.
///
/// Cloning the handle replicates the pointee through the replicator `R`;
/// dropping (and assignment, and [`ValuePtr::reset`]) releases it through
/// the destroyer `D`. Moving the handle transfers the pointee without
/// touching it. The handle may also be empty.
///
/// The defaults replicate through [`Clone`] and release through `Box`
/// semantics; see [`ClonePtr`] for trait objects and [`ValueArray`] /
/// [`CloneArray`] for heap arrays.
pub struct ValuePtr<T: ?Sized, R = DefaultCopy<T>, D = DefaultDestroy<T>>
where
    D: Destroy<T>,
{
    ptr: Option<NonNull<T>>,
    replicator: R,
    destroyer: D,
    _own: PhantomData<T>,
}

/// A value pointer for clone-dispatching pointees, typically trait objects.
pub type ClonePtr<T> = ValuePtr<T, DefaultClone<T>, DefaultDestroy<T>>;

/// A value pointer owning a heap array of `Clone` elements, its length kept
/// in the adapter `A`'s cookie.
pub type ValueArray<T, A = Itanium> = ValuePtr<T, ArrayCopy<T, A>, ArrayDestroy<T, A>>;

/// A value pointer owning a heap array replicated through the placement
/// form of [`CloneSelf`](crate::CloneSelf).
pub type CloneArray<T, A = Itanium> = ValuePtr<T, ArrayClone<T, A>, ArrayDestroy<T, A>>;

unsafe impl<T: ?Sized + Send, R: Send, D: Destroy<T> + Send> Send for ValuePtr<T, R, D> {}
unsafe impl<T: ?Sized + Sync, R: Sync, D: Destroy<T> + Sync> Sync for ValuePtr<T, R, D> {}

impl<T: ?Sized, R, D: Destroy<T>> ValuePtr<T, R, D> {
    /// Take ownership of `p` with explicit policy objects.
    ///
    /// This is the escape hatch for stateful policies
    /// ([`ReplicateWith`](crate::ReplicateWith) /
    /// [`DestroyWith`](crate::DestroyWith)); the safe constructors pair
    /// policies through [`ObjectReplicate`] and [`ArrayReplicate`] instead.
    ///
    /// # Safety
    /// See `Box::from_raw`; additionally `p` (when non-null) must have been
    /// allocated the way `destroyer` releases and `replicator` replicates.
    pub unsafe fn from_raw_in(p: *mut T, replicator: R, destroyer: D) -> Self {
        Self {
            ptr: NonNull::new(p),
            replicator,
            destroyer,
            _own: PhantomData,
        }
    }

    /// The held pointer, if any. Ownership is not affected.
    pub fn get(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    /// Whether the handle is empty.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Borrow the pointee, or `None` for an empty handle.
    pub fn as_ref(&self) -> Option<&T> {
        self.ptr.map(|p| unsafe { p.as_ref() })
    }

    /// Mutably borrow the pointee, or `None` for an empty handle.
    pub fn as_mut(&mut self) -> Option<&mut T> {
        self.ptr.map(|mut p| unsafe { p.as_mut() })
    }

    /// Give up ownership of the held pointer and leave the handle empty.
    ///
    /// The destroyer is not run; the caller must eventually release the
    /// pointee with a compatible destroyer.
    pub fn release(&mut self) -> Option<NonNull<T>> {
        self.ptr.take()
    }

    /// Consume the handle without releasing the pointee.
    pub fn into_raw(mut self) -> Option<NonNull<T>> {
        self.ptr.take()
    }

    /// Destroy the current pointee (if any) and take ownership of `p`.
    ///
    /// Resetting to the currently held pointer is a no-op.
    ///
    /// # Safety
    /// Same contract as [`ValuePtr::from_raw_in`] for `p`.
    pub unsafe fn reset(&mut self, p: Option<NonNull<T>>) {
        if p == self.ptr {
            return;
        }
        let old = mem::replace(&mut self.ptr, p);
        if let Some(old) = old {
            unsafe { self.destroyer.destroy(old) };
        }
    }

    /// Destroy the current pointee (if any) and leave the handle empty.
    pub fn clear(&mut self) {
        unsafe { self.reset(None) };
    }

    /// Exchange the entire state, pointer and policies, with `other`.
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(self, other);
    }

    /// The replicator in use.
    pub fn replicator(&self) -> &R {
        &self.replicator
    }

    /// The replicator in use, mutably.
    pub fn replicator_mut(&mut self) -> &mut R {
        &mut self.replicator
    }

    /// The destroyer in use.
    pub fn destroyer(&self) -> &D {
        &self.destroyer
    }

    /// The destroyer in use, mutably.
    pub fn destroyer_mut(&mut self) -> &mut D {
        &mut self.destroyer
    }

    fn addr(&self) -> Option<NonNull<()>> {
        self.ptr.map(NonNull::cast)
    }
}

impl<T: ?Sized, R: Default, D: Destroy<T> + Default> ValuePtr<T, R, D> {
    /// An empty handle.
    pub fn null() -> Self {
        Self {
            ptr: None,
            replicator: R::default(),
            destroyer: D::default(),
            _own: PhantomData,
        }
    }

    /// Take ownership of `p` with default policies.
    ///
    /// # Safety
    /// See `Box::from_raw`; additionally `p` (when non-null) must have been
    /// allocated the way `D`'s default releases.
    pub unsafe fn from_raw(p: *mut T) -> Self {
        unsafe { Self::from_raw_in(p, R::default(), D::default()) }
    }
}

impl<T: ?Sized, R: Default, D: Destroy<T> + Default> Default for ValuePtr<T, R, D> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, R: Default> ValuePtr<T, R, DefaultDestroy<T>> {
    /// Box `value` and own it.
    pub fn new(value: T) -> Self {
        Box::new(value).into()
    }
}

impl<T: ?Sized, R: ObjectReplicate<T> + Default> ValuePtr<T, R, DefaultDestroy<T>> {
    /// Own a fresh replica of `value`.
    pub fn from_ref(value: &T) -> Self {
        Self {
            ptr: Some(unsafe { R::default().replicate(NonNull::from(value)) }),
            replicator: R::default(),
            destroyer: DefaultDestroy::new(),
            _own: PhantomData,
        }
    }
}

/// Adopting a `Box` steals its pointer; the box gives up ownership.
impl<T: ?Sized, R: Default> From<Box<T>> for ValuePtr<T, R, DefaultDestroy<T>> {
    fn from(boxed: Box<T>) -> Self {
        unsafe { Self::from_raw_in(Box::into_raw(boxed), R::default(), DefaultDestroy::new()) }
    }
}

/// A shared pointer can never relinquish sole ownership, so adopting one
/// always replicates its pointee.
impl<T: ?Sized, R: ObjectReplicate<T> + Default> From<&Rc<T>> for ValuePtr<T, R, DefaultDestroy<T>> {
    fn from(shared: &Rc<T>) -> Self {
        Self::from_ref(shared)
    }
}

/// See the `Rc` impl: always replicates.
impl<T: ?Sized, R: ObjectReplicate<T> + Default> From<&Arc<T>>
    for ValuePtr<T, R, DefaultDestroy<T>>
{
    fn from(shared: &Arc<T>) -> Self {
        Self::from_ref(shared)
    }
}

/// Upgrades first; an expired weak pointer yields an empty handle.
impl<T: ?Sized, R: ObjectReplicate<T> + Default> From<&rc::Weak<T>>
    for ValuePtr<T, R, DefaultDestroy<T>>
{
    fn from(weak: &rc::Weak<T>) -> Self {
        match weak.upgrade() {
            Some(shared) => Self::from_ref(&shared),
            None => Self::null(),
        }
    }
}

/// Upgrades first; an expired weak pointer yields an empty handle.
impl<T: ?Sized, R: ObjectReplicate<T> + Default> From<&sync::Weak<T>>
    for ValuePtr<T, R, DefaultDestroy<T>>
{
    fn from(weak: &sync::Weak<T>) -> Self {
        match weak.upgrade() {
            Some(shared) => Self::from_ref(&shared),
            None => Self::null(),
        }
    }
}

impl<T: ?Sized, R: Replicate<T> + Clone, D: Destroy<T> + Clone> Clone for ValuePtr<T, R, D> {
    /// Replicates the pointee through the source's replicator; the copy
    /// owns its replica independently. An empty handle copies to an empty
    /// handle without allocating.
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr.map(|p| unsafe { self.replicator.replicate(p) }),
            replicator: self.replicator.clone(),
            destroyer: self.destroyer.clone(),
            _own: PhantomData,
        }
    }
}

impl<T: ?Sized, R, D: Destroy<T>> Drop for ValuePtr<T, R, D> {
    fn drop(&mut self) {
        if let Some(p) = self.ptr.take() {
            unsafe { self.destroyer.destroy(p) };
        }
    }
}

impl<T: ?Sized, R, D: Destroy<T>> Deref for ValuePtr<T, R, D> {
    type Target = T;

    /// Panics on an empty handle.
    fn deref(&self) -> &T {
        let p = self.ptr.expect("dereferenced an empty ValuePtr");
        unsafe { p.as_ref() }
    }
}

impl<T: ?Sized, R, D: Destroy<T>> DerefMut for ValuePtr<T, R, D> {
    /// Panics on an empty handle.
    fn deref_mut(&mut self) -> &mut T {
        let mut p = self.ptr.expect("dereferenced an empty ValuePtr");
        unsafe { p.as_mut() }
    }
}

// Comparisons are pointer identity, never pointee contents. Empty orders
// below everything.

impl<T: ?Sized, R, D: Destroy<T>> PartialEq for ValuePtr<T, R, D> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<T: ?Sized, R, D: Destroy<T>> Eq for ValuePtr<T, R, D> {}

impl<T: ?Sized, R, D: Destroy<T>> PartialOrd for ValuePtr<T, R, D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized, R, D: Destroy<T>> Ord for ValuePtr<T, R, D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl<T: ?Sized, R, D: Destroy<T>> fmt::Debug for ValuePtr<T, R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValuePtr").field(&self.ptr).finish()
    }
}

impl<T: ?Sized, R, D: Destroy<T>> fmt::Pointer for ValuePtr<T, R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(p) => fmt::Pointer::fmt(&p, f),
            None => fmt::Pointer::fmt(&ptr::null::<u8>(), f),
        }
    }
}

// Array surface. Only handles destroyed through an array adapter expose
// lengths and indexing; the cookie supplies the element count.

impl<T, R, A: Abi> ValuePtr<T, R, ArrayDestroy<T, A>> {
    /// Number of elements in the held array; 0 for an empty handle.
    pub fn len(&self) -> usize {
        self.ptr.map_or(0, |p| unsafe { A::element_count(p) })
    }

    /// Whether the held array has no elements (or the handle is empty).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The elements as a slice; empty for an empty handle.
    pub fn as_slice(&self) -> &[T] {
        match self.ptr {
            Some(p) => unsafe { slice::from_raw_parts(p.as_ptr(), A::element_count(p)) },
            None => &[],
        }
    }

    /// The elements as a mutable slice; empty for an empty handle.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self.ptr {
            Some(p) => unsafe { slice::from_raw_parts_mut(p.as_ptr(), A::element_count(p)) },
            None => &mut [],
        }
    }

    /// Element access without the bounds check.
    ///
    /// # Safety
    /// The handle must be non-empty and `index` must be in bounds.
    pub unsafe fn get_unchecked(&self, index: usize) -> &T {
        unsafe { &*self.ptr.unwrap_unchecked().as_ptr().add(index) }
    }

    /// Mutable element access without the bounds check.
    ///
    /// # Safety
    /// The handle must be non-empty and `index` must be in bounds.
    pub unsafe fn get_unchecked_mut(&mut self, index: usize) -> &mut T {
        unsafe { &mut *self.ptr.unwrap_unchecked().as_ptr().add(index) }
    }
}

impl<T, R: ArrayReplicate<T, A> + Default, A: Abi> ValuePtr<T, R, ArrayDestroy<T, A>> {
    /// Own a fresh `n`-element array with slot `i` initialized to `f(i)`.
    pub fn from_fn(n: usize, mut f: impl FnMut(usize) -> T) -> Self {
        let first = fill_array::<T, A>(n, |i, slot| unsafe { slot.write(f(i)) });
        Self {
            ptr: Some(first),
            replicator: R::default(),
            destroyer: ArrayDestroy::new(),
            _own: PhantomData,
        }
    }

    /// Own a fresh array cloned element-wise from `values`.
    pub fn from_slice(values: &[T]) -> Self
    where
        T: Clone,
    {
        Self::from_fn(values.len(), |i| values[i].clone())
    }
}

/// Moves the vector's elements into a cookie-tracked block; no element is
/// cloned or dropped on the way.
impl<T, R: ArrayReplicate<T, A> + Default, A: Abi> From<Vec<T>>
    for ValuePtr<T, R, ArrayDestroy<T, A>>
{
    fn from(values: Vec<T>) -> Self {
        let n = values.len();
        let first = A::allocate::<T>(n);
        let mut values = ManuallyDrop::new(values);
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), first.as_ptr(), n);
            // The buffer still has to go, but its elements moved out.
            values.set_len(0);
            ManuallyDrop::drop(&mut values);
        }
        Self {
            ptr: Some(first),
            replicator: R::default(),
            destroyer: ArrayDestroy::new(),
            _own: PhantomData,
        }
    }
}

impl<T, R, A: Abi> Index<usize> for ValuePtr<T, R, ArrayDestroy<T, A>> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T, R, A: Abi> IndexMut<usize> for ValuePtr<T, R, ArrayDestroy<T, A>> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}
