// `${...}` placeholder substitution for URLs and config values.
//
// Only `ojp.server.*` and `ojp.client.*` names may be referenced. The
// whitelist is deliberately narrow: placeholder values end up inside JDBC
// URLs handed to backend drivers, so arbitrary process properties
// (`${java.home}`, shell metacharacters smuggled into a name) must never
// be reachable from client-supplied text.

use once_cell::sync::Lazy;
use regex::Regex;

use super::PropertySource;
use crate::error::{OjpError, Result};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]*)\}").expect("placeholder regex"));

static PERMITTED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(ojp\.server\.|ojp\.client\.)[A-Za-z0-9._-]{1,200}$").expect("whitelist regex")
});

/// Substitution passes before a still-changing value is treated as a cycle.
const MAX_DEPTH: usize = 10;

/// Substitutes every `${name}` in `input` from `source`.
///
/// Resolution runs to a fixpoint so the result never contains a resolvable
/// placeholder; `resolve(resolve(x)) == resolve(x)` for any successful
/// resolution.
pub fn resolve_placeholders(input: &str, source: &PropertySource) -> Result<String> {
    let mut current = input.to_string();
    for _ in 0..MAX_DEPTH {
        let next = resolve_once(&current, source)?;
        if next == current {
            return Ok(next);
        }
        current = next;
    }
    Err(OjpError::Config(format!(
        "placeholder resolution did not converge: {input}"
    )))
}

fn resolve_once(input: &str, source: &PropertySource) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;

    for caps in PLACEHOLDER.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0");
        let name = caps.get(1).expect("capture 1").as_str();

        if !PERMITTED_NAME.is_match(name) {
            return Err(OjpError::SecurityViolation(name.to_string()));
        }
        let value = source
            .get(name)
            .ok_or_else(|| OjpError::UnresolvedPlaceholder(name.to_string()))?;

        out.push_str(&input[last_end..whole.start()]);
        out.push_str(&value);
        last_end = whole.end();
    }
    out.push_str(&input[last_end..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> PropertySource {
        let mut m = HashMap::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.to_string());
        }
        PropertySource::new(m)
    }

    #[test]
    fn test_basic_substitution() {
        let s = source(&[("ojp.server.sslrootcert", "/etc/certs/ca.pem")]);
        let out = resolve_placeholders("url=${ojp.server.sslrootcert}", &s).unwrap();
        assert_eq!(out, "url=/etc/certs/ca.pem");
    }

    #[test]
    fn test_multiple_placeholders() {
        let s = source(&[
            ("ojp.server.host", "db.internal"),
            ("ojp.server.port", "5432"),
        ]);
        let out =
            resolve_placeholders("jdbc:postgresql://${ojp.server.host}:${ojp.server.port}/app", &s)
                .unwrap();
        assert_eq!(out, "jdbc:postgresql://db.internal:5432/app");
    }

    #[test]
    fn test_non_whitelisted_name_rejected() {
        let s = source(&[]);
        let err = resolve_placeholders("${java.home}", &s).unwrap_err();
        assert!(matches!(err, OjpError::SecurityViolation(_)));
    }

    #[test]
    fn test_injection_shaped_name_rejected() {
        let s = source(&[]);
        let err = resolve_placeholders("${ojp.server.cert;rm -rf /}", &s).unwrap_err();
        assert!(matches!(err, OjpError::SecurityViolation(_)));
    }

    #[test]
    fn test_missing_value_is_unresolved() {
        let s = source(&[]);
        let err = resolve_placeholders("${ojp.client.token}", &s).unwrap_err();
        assert!(matches!(err, OjpError::UnresolvedPlaceholder(_)));
    }

    #[test]
    fn test_idempotent() {
        let s = source(&[("ojp.server.path", "/var/lib/ojp")]);
        let once = resolve_placeholders("dir=${ojp.server.path}", &s).unwrap();
        let twice = resolve_placeholders(&once, &s).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_nested_value_resolves_to_fixpoint() {
        let s = source(&[
            ("ojp.server.inner", "cluster-a"),
            ("ojp.server.outer", "${ojp.server.inner}.example.com"),
        ]);
        let out = resolve_placeholders("${ojp.server.outer}", &s).unwrap();
        assert_eq!(out, "cluster-a.example.com");
    }

    #[test]
    fn test_cycle_detected() {
        let s = source(&[
            ("ojp.server.a", "${ojp.server.b}"),
            ("ojp.server.b", "${ojp.server.a}"),
        ]);
        let err = resolve_placeholders("${ojp.server.a}", &s).unwrap_err();
        assert!(matches!(err, OjpError::Config(_)));
    }

    #[test]
    fn test_text_without_placeholders_untouched() {
        let s = source(&[]);
        let out = resolve_placeholders("jdbc:postgresql://localhost/app", &s).unwrap();
        assert_eq!(out, "jdbc:postgresql://localhost/app");
    }

    #[test]
    fn test_name_over_200_chars_rejected() {
        let s = source(&[]);
        let long = format!("${{ojp.server.{}}}", "a".repeat(201));
        let err = resolve_placeholders(&long, &s).unwrap_err();
        assert!(matches!(err, OjpError::SecurityViolation(_)));
    }
}
