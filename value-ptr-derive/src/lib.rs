//! Derive macro for the `CloneSelf` capability of the `value-ptr` crate.
//!
//! Use through `value_ptr::CloneSelf`; this crate is an implementation
//! detail.

use proc_macro::TokenStream;
use proc_macro2::Span;
use proc_macro_crate::{crate_name, FoundCrate};
use quote::quote;
use syn::{parse_macro_input, parse_quote, DeriveInput, Ident};

/// Implements `CloneSelf` in terms of the type's `Clone` impl.
///
/// The generated impl clones into a fresh `Box` for `clone_self` and into
/// the caller's slot for `clone_to`, which satisfies the trait's same
/// concrete type contract by construction.
#[proc_macro_derive(CloneSelf)]
pub fn derive_clone_self(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let root = match crate_name("value-ptr") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        // `value-ptr` aliases itself, so the `::value_ptr` path also works
        // inside its own tests and doctests (where a `crate::` path would
        // not resolve).
        Ok(FoundCrate::Itself) | Err(_) => quote!(::value_ptr),
    };

    let mut generics = input.generics;
    generics
        .make_where_clause()
        .predicates
        .push(parse_quote!(Self: ::core::clone::Clone));
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let output = quote! {
        unsafe impl #impl_generics #root::CloneSelf for #name #ty_generics #where_clause {
            fn clone_self(&self) -> ::core::ptr::NonNull<()> {
                let replica = ::std::boxed::Box::new(::core::clone::Clone::clone(self));
                let data = ::std::boxed::Box::into_raw(replica).cast::<()>();
                unsafe { ::core::ptr::NonNull::new_unchecked(data) }
            }

            unsafe fn clone_to(&self, dest: *mut ()) {
                unsafe { dest.cast::<Self>().write(::core::clone::Clone::clone(self)) };
            }
        }
    };
    TokenStream::from(output)
}
