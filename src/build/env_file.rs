use anyhow::{Context, Result};

use crate::application::ports::{open_string, SecretVault};
use crate::db::models::EnvVar;

/// Image tag exposed to compose files for `docker_build` stacks.
pub const IMAGE_VAR: &str = "STACKHOOK_IMAGE";

/// `KEY=VALUE` pairs of a dotenv file; blank lines and comments are skipped,
/// `export ` prefixes and matching outer quotes are removed.
pub fn parse_env(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Render `base` overlaid with `overlay`: overridden keys keep their position,
/// new keys are appended in order.
pub fn assemble(base: &[(String, String)], overlay: &[(String, String)]) -> String {
    let mut merged: Vec<(String, String)> = base.to_vec();
    for (key, value) in overlay {
        match merged.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }

    let mut text = String::new();
    for (key, value) in merged {
        text.push_str(&key);
        text.push('=');
        text.push_str(&value);
        text.push('\n');
    }
    text
}

/// Configured variables with secret values opened.
pub fn open_env_vars(vault: &dyn SecretVault, vars: &[EnvVar]) -> Result<Vec<(String, String)>> {
    vars.iter()
        .map(|var| {
            let value = if var.secret {
                open_string(vault, &var.value)
                    .with_context(|| format!("Failed to open secret variable {}", var.name))?
            } else {
                var.value.clone()
            };
            Ok((var.name.clone(), value))
        })
        .collect()
}
