//! `#[derive(Error)]` expansion.
//!
//! Each enum variant declares its display text with `#[error("...")]`.
//! Tuple fields interpolate positionally (`{0}`), named fields by name
//! (`{reason}`). The derive emits a `Display` impl with one match arm per
//! variant plus an empty `std::error::Error` impl.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Lit, Meta, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "Error derive supports enums only",
        ));
    };

    let name = &input.ident;
    let mut arms = Vec::with_capacity(data.variants.len());

    for variant in &data.variants {
        let ident = &variant.ident;
        let message = display_message(variant)?;

        arms.push(match &variant.fields {
            Fields::Unit => quote! {
                Self::#ident => write!(f, #message),
            },
            Fields::Unnamed(fields) => {
                let bindings: Vec<_> = (0..fields.unnamed.len())
                    .map(|i| format_ident!("f{i}"))
                    .collect();
                let message = positional_to_named(&message, bindings.len());
                quote! {
                    Self::#ident(#(#bindings),*) =>
                        write!(f, #message, #(#bindings = #bindings),*),
                }
            }
            Fields::Named(fields) => {
                let bindings: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                quote! {
                    Self::#ident { #(#bindings),* } =>
                        write!(f, #message, #(#bindings = #bindings),*),
                }
            }
        });
    }

    Ok(quote! {
        impl ::std::fmt::Display for #name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#arms)*
                }
            }
        }

        impl ::std::error::Error for #name {}
    })
}

/// Pulls the string literal out of a variant's `#[error("...")]` attribute.
fn display_message(variant: &syn::Variant) -> syn::Result<String> {
    for attr in &variant.attrs {
        if !attr.path().is_ident("error") {
            continue;
        }
        if let Meta::List(list) = &attr.meta
            && let Ok(Lit::Str(lit)) = syn::parse2::<Lit>(list.tokens.clone())
        {
            return Ok(lit.value());
        }
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "expected a string literal, e.g. #[error(\"invalid opcode: {0}\")]",
        ));
    }
    Err(syn::Error::new_spanned(
        variant,
        format!(
            "variant `{}` is missing its #[error(\"...\")] attribute",
            variant.ident
        ),
    ))
}

/// Rewrites `{0}`, `{1}`, ... to the `{f0}`, `{f1}`, ... bindings used in
/// the generated match arms. Iterates in reverse so `{10}` is not clobbered
/// by the `{1}` replacement.
fn positional_to_named(message: &str, field_count: usize) -> String {
    let mut out = message.to_string();
    for i in (0..field_count).rev() {
        out = out.replace(&format!("{{{i}}}"), &format!("{{f{i}}}"));
    }
    out
}
