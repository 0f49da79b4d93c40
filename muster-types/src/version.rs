use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A component of a loose version string.
///
/// Alphabetic segments order before numeric ones at the same position, so
/// `1.0b1` is a pre-release of `1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Component {
    Alpha(String),
    Num(u64),
}

impl Component {
    fn zero() -> Component {
        Component::Num(0)
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        use Component::*;
        match (self, other) {
            (Num(a), Num(b)) => a.cmp(b),
            (Alpha(a), Alpha(b)) => a.cmp(b),
            (Alpha(_), Num(_)) => Ordering::Less,
            (Num(_), Alpha(_)) => Ordering::Greater,
        }
    }
}

/// A permissive version: any string parses, dots separate fields, and runs of
/// digits within a field become numeric components (`1.0b1` → `1 . 0 . b . 1`).
///
/// Comparison pads the shorter version with zero components, so
/// `1.0 == 1.0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LooseVersion {
    raw: String,
    #[serde(skip)]
    components: Vec<Component>,
}

impl LooseVersion {
    pub fn new(raw: &str) -> LooseVersion {
        LooseVersion {
            raw: raw.to_string(),
            components: tokenize(raw),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Components with trailing zeros stripped; the canonical form used for
    /// equality and hashing.
    fn normalized(&self) -> &[Component] {
        let mut len = self.components.len();
        while len > 0 && self.components[len - 1] == Component::zero() {
            len -= 1;
        }
        &self.components[..len]
    }
}

fn tokenize(raw: &str) -> Vec<Component> {
    let mut out = Vec::new();
    for field in raw.trim().split('.') {
        if field.is_empty() {
            out.push(Component::zero());
            continue;
        }
        let mut chars = field.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                let run: String = {
                    let mut s = String::new();
                    while let Some(&d) = chars.peek() {
                        if !d.is_ascii_digit() {
                            break;
                        }
                        s.push(d);
                        chars.next();
                    }
                    s
                };
                match run.parse::<u64>() {
                    Ok(n) => out.push(Component::Num(n)),
                    Err(_) => out.push(Component::Alpha(run)),
                }
            } else {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        break;
                    }
                    s.push(d);
                    chars.next();
                }
                out.push(Component::Alpha(s));
            }
        }
    }
    if out.is_empty() {
        out.push(Component::zero());
    }
    out
}

impl FromStr for LooseVersion {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(LooseVersion::new(s))
    }
}

impl From<&str> for LooseVersion {
    fn from(s: &str) -> Self {
        LooseVersion::new(s)
    }
}

impl Display for LooseVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for LooseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LooseVersion {}

impl Hash for LooseVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl PartialOrd for LooseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LooseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).cloned().unwrap_or_else(Component::zero);
            let b = other.components.get(i).cloned().unwrap_or_else(Component::zero);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

/// Strips lone trailing `.0` fields, keeping at least two, so `10.6.0.0`
/// indexes the same as `10.6`.
pub fn trim_version(version: &str) -> String {
    let mut parts: Vec<&str> = version.split('.').collect();
    while parts.len() > 2 && parts.last() == Some(&"0") {
        parts.pop();
    }
    parts.join(".")
}

/// Splits a manifest item reference into `(name, version)`.
///
/// Accepts both `Name-1.2` and `Name--1.2`; the double-dash form wins when
/// both would match. The version part must begin with a digit, so
/// `my-cool-app` stays a bare name.
pub fn split_name_and_version(item_ref: &str) -> (String, Option<String>) {
    for delim in ["--", "-"] {
        if let Some((name, vers)) = item_ref.rsplit_once(delim) {
            if !name.is_empty() && vers.chars().next().map_or(false, |c| c.is_ascii_digit()) {
                return (name.to_string(), Some(vers.to_string()));
            }
        }
    }
    (item_ref.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_padding_makes_versions_equal() {
        assert_eq!(LooseVersion::new("1.0"), LooseVersion::new("1.0.0"));
        assert_eq!(LooseVersion::new("10.6"), LooseVersion::new("10.6.0.0"));
        assert_eq!(LooseVersion::new("2"), LooseVersion::new("2.0.0.0.0"));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(LooseVersion::new("1.0.1") > LooseVersion::new("1.0"));
        assert!(LooseVersion::new("2.0") > LooseVersion::new("1.9.9"));
        assert!(LooseVersion::new("10.10") > LooseVersion::new("10.9"));
        assert!(LooseVersion::new("0.9") < LooseVersion::new("0.10"));
    }

    #[test]
    fn test_alpha_suffix_is_prerelease() {
        assert!(LooseVersion::new("1.0b1") < LooseVersion::new("1.0"));
        assert!(LooseVersion::new("1.0a2") < LooseVersion::new("1.0b1"));
        assert!(LooseVersion::new("1.0b1") < LooseVersion::new("1.0b2"));
        assert!(LooseVersion::new("1.0b2") < LooseVersion::new("1.0.1"));
    }

    #[test]
    fn test_hash_agrees_with_eq() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let hash = |v: &LooseVersion| {
            let mut h = DefaultHasher::new();
            v.hash(&mut h);
            h.finish()
        };

        let a = LooseVersion::new("1.0");
        let b = LooseVersion::new("1.0.0");
        assert_eq!(a, b);
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn test_trim_version() {
        assert_eq!(trim_version("10.6.0.0"), "10.6");
        assert_eq!(trim_version("1.0"), "1.0");
        assert_eq!(trim_version("1.0.0"), "1.0");
        assert_eq!(trim_version("2"), "2");
        assert_eq!(trim_version("1.0.1.0"), "1.0.1");
    }

    #[test]
    fn test_split_name_and_version() {
        assert_eq!(
            split_name_and_version("AppA-1.0"),
            ("AppA".to_string(), Some("1.0".to_string()))
        );
        assert_eq!(
            split_name_and_version("AppA--1.0"),
            ("AppA".to_string(), Some("1.0".to_string()))
        );
        assert_eq!(split_name_and_version("my-cool-app"), ("my-cool-app".to_string(), None));
        assert_eq!(
            split_name_and_version("Firefox-102.0.1"),
            ("Firefox".to_string(), Some("102.0.1".to_string()))
        );
        assert_eq!(split_name_and_version("plain"), ("plain".to_string(), None));
    }
}
