//! Allow-list rule types and compilation
//!
//! Each allow-list entry is classified by shape and compiled into a
//! [`TargetRule`]:
//!
//! - entries containing `/` parse as CIDR networks
//! - entries containing `*` or `?` compile to anchored regular expressions
//!   (`*` becomes `.*`, `?` becomes `.`)
//! - entries containing `:` are exact `host:port` matches
//! - everything else is an exact domain match (port ignored)
//!
//! Compilation errors are fatal at startup.

use ipnet::IpNet;
use regex::Regex;

use crate::error::RuleError;

/// A compiled allow-list rule
#[derive(Debug, Clone)]
pub enum TargetRule {
    /// String-equal match on the full `host:port`
    Exact(String),

    /// Host portion parses as an IP inside the network
    Cidr(IpNet),

    /// Full `host:port` string matches the compiled pattern
    WildcardDomain(Regex),

    /// Host portion string-equal, port ignored
    ExactDomain(String),
}

impl TargetRule {
    /// Compile a single allow-list entry
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] if a CIDR entry fails to parse or a wildcard
    /// pattern fails to compile.
    pub fn compile(entry: &str) -> Result<Self, RuleError> {
        if entry.contains('/') {
            let net: IpNet = entry.parse().map_err(|e| RuleError::InvalidCidr {
                entry: entry.to_string(),
                reason: format!("{e}"),
            })?;
            return Ok(Self::Cidr(net));
        }

        if entry.contains('*') || entry.contains('?') {
            let pattern = format!(
                "^{}$",
                regex::escape(entry).replace(r"\*", ".*").replace(r"\?", ".")
            );
            let re = Regex::new(&pattern).map_err(|e| RuleError::InvalidPattern {
                entry: entry.to_string(),
                reason: format!("{e}"),
            })?;
            return Ok(Self::WildcardDomain(re));
        }

        if entry.contains(':') {
            return Ok(Self::Exact(entry.to_string()));
        }

        Ok(Self::ExactDomain(entry.to_string()))
    }

    /// Evaluate this rule against a `host:port` target
    #[must_use]
    pub fn matches(&self, target: &str) -> bool {
        match self {
            Self::Exact(raw) => target == raw,
            Self::Cidr(net) => match split_host_port(target) {
                // Port-less targets never match a CIDR rule.
                Some((host, _)) => host
                    .parse::<std::net::IpAddr>()
                    .map(|ip| net.contains(&ip))
                    .unwrap_or(false),
                None => false,
            },
            Self::WildcardDomain(re) => re.is_match(target),
            Self::ExactDomain(name) => {
                matches!(split_host_port(target), Some((host, _)) if host == name)
            }
        }
    }
}

/// Split a `host:port` target into its host and port parts
///
/// Accepts bracketed IPv6 literals (`[::1]:443`). Returns `None` when the
/// target has no port, the port is not numeric, or the host is empty.
#[must_use]
pub fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let end = rest.find(']')?;
        (&rest[..end], rest[end + 1..].strip_prefix(':')?)
    } else {
        let idx = target.rfind(':')?;
        let host = &target[..idx];
        // A second colon in the host means an unbracketed IPv6 literal.
        if host.contains(':') {
            return None;
        }
        (host, &target[idx + 1..])
    };

    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_exact() {
        let rule = TargetRule::compile("127.0.0.1:22").unwrap();
        assert!(matches!(rule, TargetRule::Exact(_)));
        assert!(rule.matches("127.0.0.1:22"));
        assert!(!rule.matches("127.0.0.1:23"));
    }

    #[test]
    fn test_compile_cidr() {
        let rule = TargetRule::compile("10.0.0.0/8").unwrap();
        assert!(rule.matches("10.1.2.3:3306"));
        assert!(!rule.matches("11.1.2.3:3306"));
        // Port-less input is invalid and never matches.
        assert!(!rule.matches("10.1.2.3"));
        // Domain hosts do not parse as IPs.
        assert!(!rule.matches("db.internal:3306"));
    }

    #[test]
    fn test_compile_cidr_invalid() {
        let err = TargetRule::compile("10.0.0.0/99").unwrap_err();
        assert!(matches!(err, RuleError::InvalidCidr { .. }));
    }

    #[test]
    fn test_compile_cidr_v6() {
        let rule = TargetRule::compile("fd00::/8").unwrap();
        assert!(rule.matches("[fd00::1]:22"));
        assert!(!rule.matches("[fe80::1]:22"));
    }

    #[test]
    fn test_compile_wildcard() {
        let rule = TargetRule::compile("*.example.com:443").unwrap();
        assert!(rule.matches("api.example.com:443"));
        assert!(rule.matches("a.b.example.com:443"));
        assert!(!rule.matches("api.example.com:80"));
        assert!(!rule.matches("example.org:443"));
    }

    #[test]
    fn test_wildcard_question_mark() {
        let rule = TargetRule::compile("db?.internal:5432").unwrap();
        assert!(rule.matches("db1.internal:5432"));
        assert!(!rule.matches("db12.internal:5432"));
    }

    #[test]
    fn test_wildcard_dot_is_literal() {
        // The dot in the entry must not act as a regex metacharacter.
        let rule = TargetRule::compile("*.example.com:443").unwrap();
        assert!(!rule.matches("apiXexampleXcom:443"));
    }

    #[test]
    fn test_compile_exact_domain() {
        let rule = TargetRule::compile("example.com").unwrap();
        assert!(rule.matches("example.com:443"));
        assert!(rule.matches("example.com:22"));
        assert!(!rule.matches("www.example.com:443"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_host_port("127.0.0.1:22"), Some(("127.0.0.1", 22)));
        assert_eq!(split_host_port("[::1]:8080"), Some(("::1", 8080)));
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port(":8080"), None);
        assert_eq!(split_host_port("host:notaport"), None);
        assert_eq!(split_host_port("::1"), None);
    }
}
