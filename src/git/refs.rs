use regex::Regex;
use std::sync::OnceLock;

use crate::db::models::GitRef;
use crate::error::GitError;

fn ref_regex() -> Result<&'static Regex, GitError> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    if let Some(regex) = REGEX.get() {
        return Ok(regex);
    }
    let regex = Regex::new(r"^[^-\s\p{Cc}~^:?*\[\\][^\s\p{Cc}~^:?*\[\\]*$")
        .map_err(|e| GitError::InvalidRef(format!("invalid ref validator: {}", e)))?;
    Ok(REGEX.get_or_init(|| regex))
}

/// Reject branch/tag names git would refuse or could mistake for options.
pub fn validate_ref_name(name: &str) -> Result<(), GitError> {
    let regex = ref_regex()?;

    let valid = regex.is_match(name)
        && !name.contains("..")
        && !name.contains("@{")
        && !name.contains("//")
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with('.')
        && !name.ends_with(".lock")
        && name != "@";

    if valid {
        Ok(())
    } else {
        Err(GitError::InvalidRef(name.to_string()))
    }
}

pub fn validate_ref(git_ref: &GitRef) -> Result<(), GitError> {
    validate_ref_name(git_ref.name())
}
