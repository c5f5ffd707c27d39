// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`nss::ddi::kstat::KStatProvider`] implementation
/// given a struct of named fields of type
/// [`nss::ddi::kstat::KStatU64`].
///
/// ```Rust
/// #[derive(KStatProvider)]
/// struct DrvStats {
///     tx_cmd_req: KStatU64,
///     rx_cmd_resp: KStatU64,
/// }
/// ```
///
/// Besides the trait impl this emits a plain `DrvStatsSnap` struct of
/// `u64` fields, which is what `snapshot()` returns.
#[proc_macro_derive(KStatProvider)]
pub fn derive_kstat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);
    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            syn::Fields::Unnamed(_) => {
                return syn::Error::new_spanned(
                    &ident,
                    "a KStatProvider cannot have unnamed fields",
                )
                .to_compile_error()
                .into();
            }

            syn::Fields::Unit => {
                return syn::Error::new_spanned(
                    &ident,
                    "a unit struct cannot be a KStatProvider",
                )
                .to_compile_error()
                .into();
            }
        },

        _ => {
            return syn::Error::new_spanned(
                &ident,
                "only a struct may be a KStatProvider",
            )
            .to_compile_error()
            .into();
        }
    };

    let num_fields = fields.len() as u32;
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output = quote! {
        #[derive(
            Clone, Copy, Debug, Default, Eq, PartialEq, ::serde::Serialize,
        )]
        pub struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl ::nss::ddi::kstat::KStatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn init(
                &mut self
            ) -> core::result::Result<(), ::nss::ddi::kstat::Error> {
                #( self.#fields_ident.init(stringify!(#fields_ident))?; )*
                Ok(())
            }

            fn new() -> Self {
                use ::nss::ddi::kstat::KStatU64;

                Self {
                    #( #fields_ident: KStatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }
        }
    };

    output.into()
}
