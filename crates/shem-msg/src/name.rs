//! ---
//! shem_section: "02-module-messaging"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Validation and splitting of module and variable names."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use crate::{CodecError, MAX_NAME_LENGTH};

/// Split `module.variable` into components at the first dot. Does not
/// validate. Returns `(None, name)` for an unqualified name.
pub fn split_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((module, variable)) => (Some(module), variable),
        None => (None, name),
    }
}

/// Check that a name component (module or variable) is valid: 1-100
/// characters, alphanumeric plus underscore.
pub fn validate_name_part(name: &str) -> Result<(), CodecError> {
    if name.is_empty() {
        return Err(CodecError::InvalidName("empty name".to_owned()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(CodecError::InvalidName(format!(
            "exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    for c in name.chars() {
        if !is_name_char(c) {
            return Err(CodecError::InvalidName(format!("invalid character {c:?}")));
        }
    }
    Ok(())
}

/// Check a name, allowing the qualified `module.variable` form.
pub fn validate_name(name: &str) -> Result<(), CodecError> {
    if name.starts_with('.') {
        return Err(CodecError::InvalidName("dot at start".to_owned()));
    }

    let (module, variable) = split_name(name);
    validate_name_part(variable)?;
    match module {
        Some(module) => validate_name_part(module),
        None => Ok(()),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
