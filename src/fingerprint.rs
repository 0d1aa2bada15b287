use regex::Regex;
use std::sync::OnceLock;

static RE_NUMBER: OnceLock<Regex> = OnceLock::new();
static RE_STRING: OnceLock<Regex> = OnceLock::new();

/// Normalizes a query so that executions differing only in literal values
/// share one aggregation key.
///
/// Normalization:
/// - Replaces signed decimal numbers (`42`, `-1.5`, `.25`) with `?`
/// - Replaces single-quoted strings with `?`
/// - Drops the last two characters when the text ends in `"`
///
/// Numbers are replaced first, so a string literal containing digits still
/// collapses to a single `?`.
pub fn normalize(text: &str) -> String {
    let re_number = RE_NUMBER.get_or_init(|| Regex::new(r"[-+]?\d*\.?\d+").unwrap());
    let re_string = RE_STRING.get_or_init(|| Regex::new(r"'[^']*'").unwrap());

    let no_numbers = re_number.replace_all(text, "?");
    let mut normalized = re_string.replace_all(&no_numbers, "?").into_owned();

    // CloudWatch exports wrap the message in quotes; two characters go, not one.
    if normalized.ends_with('"') {
        normalized.pop();
        normalized.pop();
    }

    normalized
}

/// Short stable identifier for a normalized query.
pub fn query_id(normalized: &str) -> String {
    format!("{:x}", md5::compute(normalized))
}
