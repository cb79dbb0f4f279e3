//! Parsing for the Entity derive macro.
//!
//! Extracts `#[rowmap(...)]` attributes from the derive input into an
//! [`EntityDef`] and checks the declaration-level rules that can be caught
//! at compile time. Everything else is validated again when the mapping is
//! registered at runtime.

use proc_macro2::Span;
use syn::{
    Attribute, Data, DeriveInput, Error, Field, Fields, GenericArgument, Ident, Lit,
    PathArguments, Result, Type,
};

/// Parsed entity from a struct with `#[derive(Entity)]`.
#[derive(Debug)]
pub struct EntityDef {
    pub name: Ident,
    pub table_name: String,
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    /// Fields that map to a column.
    pub fn persistent_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.skip)
    }
}

/// Parsed field of an entity struct.
#[derive(Debug)]
pub struct FieldDef {
    pub name: Ident,
    pub column_name: String,
    pub ty: Type,
    /// Explicit SQL type name from `sql_type = "..."`
    pub sql_type: Option<String>,
    /// Forced nullable; `Option<T>` fields are nullable regardless
    pub nullable: bool,
    pub identity: bool,
    pub generated: bool,
    pub version: bool,
    /// Not persisted; filled with `Default::default()` on load
    pub skip: bool,
}

/// Parse and check a derive input.
pub fn parse_entity(input: &DeriveInput) -> Result<EntityDef> {
    let name = input.ident.clone();

    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "Entity cannot be derived for generic structs",
        ));
    }

    let fields = match &input.data {
        Data::Struct(data) => parse_fields(&data.fields)?,
        Data::Enum(_) => {
            return Err(Error::new_spanned(
                input,
                "Entity can only be derived for structs, not enums",
            ));
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(
                input,
                "Entity can only be derived for structs, not unions",
            ));
        }
    };

    let table_name = match parse_struct_attrs(&input.attrs)? {
        Some(table) => table,
        None => pluralize(&to_snake_case(&name.to_string())),
    };

    let entity = EntityDef {
        name,
        table_name,
        fields,
    };
    check_entity(&entity)?;
    Ok(entity)
}

/// Parse struct-level `#[rowmap(table = "...")]`.
fn parse_struct_attrs(attrs: &[Attribute]) -> Result<Option<String>> {
    let mut table_name = None;

    for attr in attrs {
        if !attr.path().is_ident("rowmap") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                if table_name.is_some() {
                    return Err(Error::new_spanned(
                        meta.path,
                        "duplicate rowmap attribute: table",
                    ));
                }
                table_name = Some(string_value(&meta, "table")?);
                Ok(())
            } else {
                Err(Error::new_spanned(
                    meta.path,
                    "unknown rowmap attribute on a struct; expected `table`",
                ))
            }
        })?;
    }

    Ok(table_name)
}

fn string_value(meta: &syn::meta::ParseNestedMeta<'_>, key: &str) -> Result<String> {
    let value: Lit = meta.value()?.parse()?;
    match value {
        Lit::Str(lit) => Ok(lit.value()),
        other => Err(Error::new_spanned(
            other,
            format!("expected string literal for {key}"),
        )),
    }
}

fn parse_fields(fields: &Fields) -> Result<Vec<FieldDef>> {
    match fields {
        Fields::Named(named) => named.named.iter().map(parse_field).collect(),
        Fields::Unnamed(_) => Err(Error::new(
            Span::call_site(),
            "Entity requires a struct with named fields, not a tuple struct",
        )),
        Fields::Unit => Err(Error::new(
            Span::call_site(),
            "Entity requires a struct with fields, not a unit struct",
        )),
    }
}

fn parse_field(field: &Field) -> Result<FieldDef> {
    let name = field
        .ident
        .clone()
        .ok_or_else(|| Error::new_spanned(field, "expected named field"))?;

    let mut def = FieldDef {
        column_name: name.to_string().trim_start_matches("r#").to_string(),
        name,
        ty: field.ty.clone(),
        sql_type: None,
        nullable: false,
        identity: false,
        generated: false,
        version: false,
        skip: false,
    };

    for attr in &field.attrs {
        if !attr.path().is_ident("rowmap") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            let path = &meta.path;
            if path.is_ident("identity") {
                def.identity = true;
            } else if path.is_ident("generated") {
                def.generated = true;
            } else if path.is_ident("version") {
                def.version = true;
            } else if path.is_ident("nullable") {
                def.nullable = true;
            } else if path.is_ident("skip") {
                def.skip = true;
            } else if path.is_ident("column") {
                def.column_name = string_value(&meta, "column name")?;
            } else if path.is_ident("sql_type") {
                let name = string_value(&meta, "sql_type")?;
                if sql_type_variant(&name).is_none() {
                    return Err(Error::new_spanned(
                        path,
                        format!("unknown sql_type \"{name}\""),
                    ));
                }
                def.sql_type = Some(name);
            } else {
                return Err(Error::new_spanned(
                    path,
                    "unknown rowmap attribute; expected one of identity, generated, version, \
                     nullable, skip, column, sql_type",
                ));
            }
            Ok(())
        })?;
    }

    Ok(def)
}

/// Declaration rules that do not need type information.
fn check_entity(entity: &EntityDef) -> Result<()> {
    let mut identity: Option<&FieldDef> = None;
    let mut version: Option<&FieldDef> = None;

    for field in &entity.fields {
        if field.skip && (field.identity || field.generated || field.version) {
            return Err(Error::new_spanned(
                &field.name,
                "a skipped field cannot be identity, generated or version",
            ));
        }
        if field.identity {
            if let Some(first) = identity {
                return Err(Error::new_spanned(
                    &field.name,
                    format!("`{}` is already the identity", first.name),
                ));
            }
            identity = Some(field);
        }
        if field.generated && !field.identity {
            return Err(Error::new_spanned(
                &field.name,
                "`generated` only applies to the identity field",
            ));
        }
        if field.version {
            if field.identity {
                return Err(Error::new_spanned(
                    &field.name,
                    "the version field cannot be the identity",
                ));
            }
            if is_option_type(&field.ty) {
                return Err(Error::new_spanned(
                    &field.ty,
                    "the version field cannot be an Option",
                ));
            }
            if let Some(first) = version {
                return Err(Error::new_spanned(
                    &field.name,
                    format!("`{}` is already the version field", first.name),
                ));
            }
            version = Some(field);
        }
    }

    if identity.is_none() {
        return Err(Error::new_spanned(
            &entity.name,
            "Entity needs exactly one field marked #[rowmap(identity)]",
        ));
    }
    Ok(())
}

/// `rowmap_core::SqlType` variant for an attribute spelling.
pub fn sql_type_variant(name: &str) -> Option<&'static str> {
    let variant = match name.to_ascii_lowercase().as_str() {
        "smallint" | "int2" => "SmallInt",
        "integer" | "int" | "int4" => "Integer",
        "bigint" | "int8" => "BigInt",
        "real" | "float4" => "Real",
        "double" | "float8" => "Double",
        "decimal" | "numeric" => "Decimal",
        "boolean" | "bool" => "Boolean",
        "text" | "varchar" => "Text",
        "blob" | "bytea" => "Blob",
        "date" => "Date",
        "time" => "Time",
        "timestamp" => "Timestamp",
        "uuid" => "Uuid",
        "json" | "jsonb" => "Json",
        _ => return None,
    };
    Some(variant)
}

/// Is `ty` written as `Option<...>`?
pub fn is_option_type(ty: &Type) -> bool {
    let Type::Path(path) = ty else {
        return false;
    };
    path.path.segments.last().is_some_and(|seg| {
        seg.ident == "Option"
            && matches!(
                &seg.arguments,
                PathArguments::AngleBracketed(args)
                    if matches!(args.args.first(), Some(GenericArgument::Type(_)))
            )
    })
}

/// Convert PascalCase to snake_case.
///
/// - `User` -> `user`
/// - `AuditEntry` -> `audit_entry`
/// - `HTTPToken` -> `http_token`
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    let chars: Vec<char> = s.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                let prev = chars[i - 1];
                let next = chars.get(i + 1).copied();
                // New word after a lowercase letter, or the last capital of an acronym.
                if prev.is_lowercase()
                    || (prev.is_uppercase() && next.is_some_and(|n| n.is_lowercase()))
                {
                    result.push('_');
                }
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }

    result
}

/// Plural table name for a snake_case entity name.
fn pluralize(word: &str) -> String {
    match word {
        "person" => return "people".to_string(),
        "child" => return "children".to_string(),
        "" => return String::new(),
        _ => {}
    }

    if word.ends_with('s') || word.ends_with('x') || word.ends_with("ch") || word.ends_with("sh") {
        return format!("{word}es");
    }
    if let Some(stem) = word.strip_suffix('y') {
        if stem.chars().last().is_some_and(|c| !"aeiou".contains(c)) {
            return format!("{stem}ies");
        }
    }
    format!("{word}s")
}
