extern crate proc_macro;
use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derives `Encode` for a struct with named fields by concatenating the
/// encodings of its fields in declaration order.
#[proc_macro_derive(Encode)]
pub fn encode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields = match named_fields(&input.data) {
        Ok(fields) => fields,
        Err(msg) => {
            return syn::Error::new_spanned(name, msg).to_compile_error().into();
        }
    };

    let encoding = fields.iter().map(|f| {
        let field_name = &f.ident;
        quote! {
            encoder = encoder.append(&self.#field_name);
        }
    });

    let expanded = quote! {
        impl crate::storage::encdec::Encode for #name {
            fn encode(&self) -> Vec<u8> {
                let mut encoder = crate::storage::encdec::EncodeBuilder::new();

                #(#encoding)*

                encoder.build()
            }
        }
    };

    expanded.into()
}

/// Derives `Decode` for a struct with named fields, consuming the input in
/// field declaration order and returning the remaining bytes.
#[proc_macro_derive(Decode)]
pub fn decode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields = match named_fields(&input.data) {
        Ok(fields) => fields,
        Err(msg) => {
            return syn::Error::new_spanned(name, msg).to_compile_error().into();
        }
    };

    let field_names: Vec<_> = fields.iter().map(|f| &f.ident).collect();
    let field_decodes = fields.iter().map(|f| {
        let field_name = &f.ident;
        let field_ty = &f.ty;

        quote! {
            let (#field_name, rest) = <#field_ty as crate::storage::encdec::Decode>::decode(bytes)?;
            bytes = rest;
        }
    });

    let expanded = quote! {
        impl crate::storage::encdec::Decode for #name {
            fn decode(bytes: &[u8]) -> crate::DecodingResult<'_, Self> {
                let mut bytes = bytes;

                #(#field_decodes)*

                Ok((Self { #(#field_names),* }, bytes))
            }
        }
    };

    expanded.into()
}

fn named_fields(
    data: &Data,
) -> Result<&syn::punctuated::Punctuated<syn::Field, syn::Token![,]>, &'static str> {
    match data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => Ok(&fields.named),
            _ => Err("only structs with named fields are supported"),
        },
        _ => Err("only structs are supported"),
    }
}
