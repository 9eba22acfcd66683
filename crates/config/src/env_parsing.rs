use std::collections::HashSet;

pub(crate) fn parse_env_bool(value: String) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Splits a comma-separated env value into trimmed, de-quoted, de-duplicated
/// entries. Duplicates after case normalization are dropped, not rejected:
/// program id lists come from copy-pasted dashboards and repeats are common.
pub(crate) fn parse_csv_env(csv: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut seen_normalized = HashSet::new();
    for token in csv
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .split(',')
    {
        let entry = token.trim().trim_matches('"').trim_matches('\'');
        if entry.is_empty() {
            continue;
        }
        if seen_normalized.insert(entry.to_ascii_lowercase()) {
            values.push(entry.to_string());
        }
    }
    values
}

pub(crate) fn parse_env_number<T: std::str::FromStr>(value: String) -> Option<T> {
    value.trim().parse::<T>().ok()
}
