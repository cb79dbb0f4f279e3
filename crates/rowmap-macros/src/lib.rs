//! Derive macro for rowmap entities.
//!
//! `#[derive(Entity)]` implements `rowmap_core::Entity` for a struct with
//! named fields: the static field metadata, value extraction in field order,
//! hydration from a `Record`, and by-name assignment used to write generated
//! identities and bumped versions back.

use proc_macro::TokenStream;
use quote::quote;
use syn::ext::IdentExt;

mod parse;

use parse::{EntityDef, FieldDef, is_option_type, parse_entity, sql_type_variant};

/// Derive `Entity` for a struct.
///
/// # Attributes
///
/// On the struct:
/// - `#[rowmap(table = "name")]`: table name; defaults to the plural
///   snake_case struct name
///
/// On fields:
/// - `identity`: the identity column (exactly one)
/// - `generated`: the identity value is produced on insert when absent
/// - `version`: integer column used for optimistic locking
/// - `column = "name"`: column name, defaults to the field name
/// - `sql_type = "uuid"`: declared type, defaults to the field's `TypeInfo`
/// - `nullable`: accept NULL even for a non-`Option` type
/// - `skip`: not persisted; loaded as `Default::default()`
///
/// # Example
///
/// ```ignore
/// use rowmap::Entity;
///
/// #[derive(Entity)]
/// #[rowmap(table = "users")]
/// struct User {
///     #[rowmap(identity)]
///     id: i64,
///     name: String,
///     #[rowmap(version)]
///     version: i64,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(rowmap))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as syn::DeriveInput);

    let entity = match parse_entity(&input) {
        Ok(e) => e,
        Err(e) => return e.to_compile_error().into(),
    };

    generate_entity_impl(&entity).into()
}

fn generate_entity_impl(entity: &EntityDef) -> proc_macro2::TokenStream {
    let name = &entity.name;
    let table_name = &entity.table_name;
    let field_infos: Vec<_> = entity.persistent_fields().map(generate_field_info).collect();
    let field_count = field_infos.len();
    let to_values = generate_to_values(entity);
    let from_record = generate_from_record(entity);
    let assign = generate_assign(entity);

    quote! {
        impl ::rowmap_core::Entity for #name {
            const TABLE_NAME: &'static str = #table_name;

            fn fields() -> &'static [::rowmap_core::FieldInfo] {
                static FIELDS: [::rowmap_core::FieldInfo; #field_count] = [#(#field_infos),*];
                &FIELDS
            }

            #to_values
            #from_record
            #assign
        }
    }
}

fn field_key(field: &FieldDef) -> String {
    field.name.unraw().to_string()
}

/// One `FieldInfo` constant expression.
fn generate_field_info(field: &FieldDef) -> proc_macro2::TokenStream {
    let key = field_key(field);
    let column = &field.column_name;
    let ty = &field.ty;
    let forced_nullable = field.nullable;
    let identity = field.identity;
    let generated = field.generated;
    let version = field.version;

    let (sql_type, nullable) = match field.sql_type.as_deref().and_then(sql_type_variant) {
        Some(variant) => {
            let variant = syn::Ident::new(variant, proc_macro2::Span::call_site());
            let nullable = forced_nullable || is_option_type(ty);
            (quote! { ::rowmap_core::SqlType::#variant }, quote! { #nullable })
        }
        None => (
            quote! { <#ty as ::rowmap_core::TypeInfo>::SQL_TYPE },
            quote! { <#ty as ::rowmap_core::TypeInfo>::NULLABLE || #forced_nullable },
        ),
    };

    quote! {
        ::rowmap_core::FieldInfo::new(#key, #column, #sql_type)
            .nullable(#nullable)
            .identity(#identity)
            .generated(#generated)
            .version(#version)
    }
}

fn generate_to_values(entity: &EntityDef) -> proc_macro2::TokenStream {
    let values = entity.persistent_fields().map(|field| {
        let ident = &field.name;
        quote! { ::rowmap_core::Value::from(::core::clone::Clone::clone(&self.#ident)) }
    });

    quote! {
        fn to_values(&self) -> ::std::vec::Vec<::rowmap_core::Value> {
            ::std::vec![#(#values),*]
        }
    }
}

fn generate_from_record(entity: &EntityDef) -> proc_macro2::TokenStream {
    let inits = entity.fields.iter().map(|field| {
        let ident = &field.name;
        if field.skip {
            quote! { #ident: ::core::default::Default::default() }
        } else {
            let key = field_key(field);
            quote! { #ident: record.get(#key)? }
        }
    });

    quote! {
        fn from_record(record: &::rowmap_core::Record<'_>) -> ::rowmap_core::Result<Self> {
            ::core::result::Result::Ok(Self {
                #(#inits),*
            })
        }
    }
}

fn generate_assign(entity: &EntityDef) -> proc_macro2::TokenStream {
    let arms = entity.persistent_fields().map(|field| {
        let ident = &field.name;
        let key = field_key(field);
        quote! {
            #key => self.#ident = ::rowmap_core::FromValue::from_value(value)?,
        }
    });

    quote! {
        fn assign(
            &mut self,
            field: &str,
            value: &::rowmap_core::Value,
        ) -> ::rowmap_core::Result<()> {
            match field {
                #(#arms)*
                _ => return ::core::result::Result::Err(::rowmap_core::unknown_field::<Self>(field)),
            }
            ::core::result::Result::Ok(())
        }
    }
}
