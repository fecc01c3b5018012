//! `[k:v]` settings declaration parsing, rewriting, and fingerprinting.

use crate::error::QueryBuildError;
use blake2::Blake2bVar;
use blake2::digest::{Update, VariableOutput};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Default `[timeout:*]` setting, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 180;
/// Default `[maxsize:*]` setting, in bytes (512 MiB).
pub const DEFAULT_MAXSIZE_BYTES: u64 = 512 * 1024 * 1024;

static SETTING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\w+?):(.+?)\]\s*;?").expect("valid regex"));

/// Parses the `[k:v]` settings declaration out of `input_code`, applies the
/// `out=json`/`timeout`/`maxsize` defaults, and rejects a non-`json`
/// `[out:*]` declaration.
pub fn parse_settings(input_code: &str) -> Result<BTreeMap<String, String>, QueryBuildError> {
    let mut settings = BTreeMap::new();
    for caps in SETTING_RE.captures_iter(input_code) {
        settings.insert(caps[1].to_string(), caps[2].to_string());
    }

    if let Some(out) = settings.get("out") {
        if out != "json" {
            return Err(QueryBuildError::NonJsonOutput(out.clone()));
        }
    }
    settings.insert("out".to_string(), "json".to_string());

    settings
        .entry("maxsize".to_string())
        .or_insert_with(|| DEFAULT_MAXSIZE_BYTES.to_string());
    settings
        .entry("timeout".to_string())
        .or_insert_with(|| DEFAULT_TIMEOUT_SECS.to_string());

    Ok(settings)
}

/// Removes the original settings declaration from `input_code`, leaving the
/// rest of the QL body untouched.
pub fn strip_settings(input_code: &str) -> String {
    SETTING_RE.replace_all(input_code, "").into_owned()
}

/// Builds the effective QL sent to the server: the current `settings`
/// prepended as a single declaration, followed by the settings-stripped
/// body. `[out:*]` always appears exactly once, as `json`.
pub fn rewrite(settings: &BTreeMap<String, String>, input_code: &str) -> String {
    let mut declaration = String::new();
    for (k, v) in settings {
        declaration.push('[');
        declaration.push_str(k);
        declaration.push(':');
        declaration.push_str(v);
        declaration.push(']');
    }
    declaration.push(';');

    let body = strip_settings(input_code);
    format!("{declaration}\n{body}")
}

/// A short, fixed-width hex digest (64-bit BLAKE2b) of `code`.
///
/// Callers pass the settings-stripped `input_code`, never the effective QL,
/// so that `[timeout:*]`/`[maxsize:*]` adjustments across retries do not
/// change the fingerprint.
pub fn fingerprint(code: &str) -> String {
    let mut hasher = Blake2bVar::new(8).expect("8 is a valid BLAKE2b output size");
    hasher.update(code.as_bytes());
    let mut buf = [0u8; 8];
    hasher.finalize_variable(&mut buf).expect("buffer sized to output");
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_settings_and_applies_defaults() {
        let settings = parse_settings("[timeout:30];\nnode(1);out;").unwrap();
        assert_eq!(settings.get("timeout").map(String::as_str), Some("30"));
        assert_eq!(settings.get("out").map(String::as_str), Some("json"));
        assert_eq!(
            settings.get("maxsize").map(String::as_str),
            Some(DEFAULT_MAXSIZE_BYTES.to_string()).as_deref()
        );
    }

    #[test]
    fn rejects_non_json_out_setting() {
        let err = parse_settings("[out:xml];\nnode(1);out;").unwrap_err();
        assert!(matches!(err, QueryBuildError::NonJsonOutput(_)));
    }

    #[test]
    fn strip_settings_removes_declaration_only() {
        let stripped = strip_settings("[out:json][timeout:30];\nnode(1);out;");
        assert_eq!(stripped, "\nnode(1);out;");
    }

    #[test]
    fn rewrite_is_a_fixed_point() {
        let settings = parse_settings("[timeout:30];\nnode(1);out;").unwrap();
        let once = rewrite(&settings, "[timeout:30];\nnode(1);out;");

        let settings_again = parse_settings(&once).unwrap();
        let twice = rewrite(&settings_again, &once);

        assert_eq!(once, twice);
    }

    #[test]
    fn cache_key_ignores_settings_changes() {
        let original = "[timeout:30];\nnode(1);out;";
        let mut settings = parse_settings(original).unwrap();
        let stripped = strip_settings(original);
        let key_before = fingerprint(&stripped);

        settings.insert("timeout".to_string(), "60".to_string());
        let key_after = fingerprint(&stripped);

        assert_eq!(key_before, key_after);
        assert_eq!(key_before.len(), 16);
    }
}
