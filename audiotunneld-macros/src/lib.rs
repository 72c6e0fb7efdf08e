use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

use proc_macro::TokenStream;

/// Derives `WriteBytesLe` for a struct by serialising every field in
/// declaration order, with no padding.
///
/// The generated impls refer to `crate::utils::byteorder`, so the derive is
/// only usable inside the `audiotunnel` library crate.
#[proc_macro_derive(ToBytes)]
pub fn derive_to_bytes(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields: Vec<syn::Member> = match input.data {
        Data::Struct(ref s) => match s.fields {
            Fields::Named(ref nf) => nf
                .named
                .iter()
                .filter_map(|f| f.ident.clone().map(Into::into))
                .collect(),
            Fields::Unnamed(ref uf) => uf
                .unnamed
                .iter()
                .enumerate()
                .map(|(i, _)| syn::Index::from(i).into())
                .collect(),
            Fields::Unit => Vec::new(),
        },
        _ => {
            return TokenStream::from(
                syn::Error::new_spanned(&name, "ToBytes can only be derived for structs")
                    .to_compile_error(),
            );
        }
    };

    let expanded = quote! {
        impl crate::utils::byteorder::WriteBytesLe for #name {
            fn write_le(&self, dst: &mut Vec<u8>) {
                #( crate::utils::byteorder::WriteBytesLe::write_le(&self.#fields, dst); )*
            }
        }
    };

    TokenStream::from(expanded)
}
