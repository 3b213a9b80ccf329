//! # Codec
//!
//! Textual encodings shared by the PMU and tracefs probe interfaces.

use anyhow::{anyhow, bail, Result};
use rand::{rngs::OsRng, RngCore};

use super::ProbeArgs;

/// Turn a symbol name into an identifier usable as a tracefs event name: any
/// run of characters other than ASCII alphanumerics and '_' becomes a single
/// '_'.
pub fn sanitize_symbol(symbol: &str) -> String {
    let mut sanitized = String::with_capacity(symbol.len());
    let mut replaced = false;

    for c in symbol.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            sanitized.push(c);
            replaced = false;
        } else if !replaced {
            sanitized.push('_');
            replaced = true;
        }
    }

    sanitized
}

/// Build the `<path>:0x<offset>[(0x<ref_ctr_offset>)]` uprobe target, as
/// understood by `uprobe_events`.
pub fn uprobe_token(args: &ProbeArgs) -> String {
    let mut token = format!("{}:{:#x}", args.path.display(), args.offset);
    if args.ref_ctr_offset != 0 {
        token.push_str(&format!("({:#x})", args.ref_ctr_offset));
    }
    token
}

/// Generate a tracefs group name made of `prefix` and a random suffix, so
/// events defined by unrelated callers do not collide.
pub fn random_group(prefix: &str) -> Result<String> {
    let mut bytes = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| anyhow!("Could not generate a random group name: {e}"))?;

    let group = format!("{prefix}_{}", hex::encode(bytes));
    if !is_valid_group(&group) {
        bail!("Invalid tracefs group name {group}");
    }

    Ok(group)
}

/// Group and event names must match `[a-zA-Z_][0-9a-zA-Z_]*`.
fn is_valid_group(group: &str) -> bool {
    let mut chars = group.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
