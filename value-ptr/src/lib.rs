//! This is a crate providing owning pointers with value semantics.
//!
//! A [`ValuePtr`] owns its pointee exclusively, like a `Box`, but it is
//! copyable: cloning the handle produces an independently owned replica of
//! the pointee. Replication and destruction are pluggable policy objects,
//! so the same handle type covers plain objects, clone-dispatched trait
//! objects ([`ClonePtr`]) and heap arrays whose length is tracked in a
//! hidden cookie ([`ValueArray`], [`CloneArray`]).

#![feature(allocator_api)]
#![feature(ptr_metadata)]
#![warn(missing_docs)]

// The derive expands to `::value_ptr` paths; this alias makes them resolve
// inside the crate's own tests as well.
extern crate self as value_ptr;

use std::ptr::NonNull;

pub use value_ptr_derive::CloneSelf;

mod abi;
pub use abi::{Abi, Counted, Itanium};

mod handler;
pub use handler::{
    ArrayClone, ArrayCopy, ArrayDestroy, ArrayReplicate, DefaultClone, DefaultCopy,
    DefaultDestroy, Destroy, DestroyWith, ObjectReplicate, Replicate, ReplicateWith,
};

#[path = "value_ptr.rs"]
mod value_ptr_impl;
pub use value_ptr_impl::{CloneArray, ClonePtr, ValueArray, ValuePtr};

/// Replication capability dispatched through the pointee itself.
///
/// A type opting in promises to produce a replica of its *concrete* type,
/// which is what keeps replication of a `dyn` pointee from losing the
/// state a copy through the statically known type would drop. Declare it
/// as a supertrait of your object-safe trait and every `dyn` of that trait
/// gains the capability:
///
/// ```
/// use value_ptr::{ClonePtr, CloneSelf};
///
/// trait Shape: CloneSelf {
///     fn area(&self) -> f64;
/// }
///
/// #[derive(Clone, CloneSelf)]
/// struct Circle {
///     radius: f64,
/// }
///
/// impl Shape for Circle {
///     fn area(&self) -> f64 {
///         std::f64::consts::PI * self.radius * self.radius
///     }
/// }
///
/// let shape: ClonePtr<dyn Shape> = (Box::new(Circle { radius: 2.0 }) as Box<dyn Shape>).into();
/// assert_eq!(shape.clone().area(), shape.area());
/// ```
///
/// Use `#[derive(CloneSelf)]` on any [`Clone`] type rather than writing the
/// impl by hand.
///
/// # Safety
/// `clone_self` must return a pointer obtained from `Box::into_raw` of a
/// freshly allocated value of the same concrete type as `self`, and
/// `clone_to` must initialize `dest` with such a value. Violating either
/// makes the policies built on top free or dispatch through the wrong
/// layout.
pub unsafe trait CloneSelf {
    /// Clone onto the heap and return the replica's data pointer.
    ///
    /// The pointer is deliberately thin; callers re-attach whatever
    /// metadata the source pointer carried.
    fn clone_self(&self) -> NonNull<()>;

    /// Clone into caller-supplied storage.
    ///
    /// # Safety
    /// `dest` must be valid for writes of the concrete type of `self`,
    /// properly aligned, and must not overlap `self`.
    unsafe fn clone_to(&self, dest: *mut ());
}
