//! Flag value parsing for `crun run`

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Memory size in bytes.
///
/// `k`/`m`/`g` and `KiB`/`MiB`/`GiB` are binary, `KB`/`MB`/`GB` decimal.
/// Units are case-insensitive; a bare number is bytes.
pub fn parse_memory(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .with_context(|| format!("invalid memory size: {:?}", value))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        other => bail!("invalid memory unit {:?} in {:?}", other, value),
    };
    Ok((number * multiplier as f64) as u64)
}

/// One `KEY=value` line.
///
/// Blank and `#` lines yield `None`. A bare `KEY` takes its value from
/// `lookup` and is skipped when unset.
pub fn parse_env_line(
    line: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<(String, String)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() || line.trim_start().starts_with('#') {
        return None;
    }
    match line.split_once('=') {
        Some((key, value)) => {
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        }
        None => {
            let key = line.trim();
            lookup(key).map(|value| (key.to_string(), value))
        }
    }
}

/// Apply every line of an env file to `env`, later lines winning
pub fn parse_env_file(path: &Path, env: &mut BTreeMap<String, String>) -> Result<usize> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read env file {}", path.display()))?;
    let mut count = 0;
    for line in contents.lines() {
        if let Some((key, value)) = parse_env_line(line, |k| std::env::var(k).ok()) {
            env.insert(key, value);
            count += 1;
        }
    }
    Ok(count)
}
