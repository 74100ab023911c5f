//! Distinguished name parsing and comparison.
//!
//! Implements the string form of RFC 4514 closely enough to parse anything a
//! directory returns in `memberOf` and anything an operator writes in the
//! role mapping. Comparison uses a normalized form: attribute types are
//! lowercased, values are lowercased with runs of whitespace collapsed.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::DnError;

/// Characters that must be escaped anywhere in a value.
const ESCAPE_ANYWHERE: &[char] = &[',', '+', '"', '\\', '<', '>', ';'];

/// Characters that may follow a backslash literally.
const ESCAPABLE: &[char] = &[',', '+', '"', '\\', '<', '>', ';', '=', ' ', '#'];

fn attribute_type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z][A-Za-z0-9-]*|[0-9]+(?:\.[0-9]+)*)$")
            .expect("attribute type pattern is valid")
    })
}

/// Whether `name` is a syntactically valid attribute type (descriptor or
/// numeric OID).
pub fn is_valid_attribute_type(name: &str) -> bool {
    attribute_type_regex().is_match(name)
}

// ---------------------------------------------------------------------------
// AttributeValueAssertion / Rdn
// ---------------------------------------------------------------------------

/// A single `type=value` pair.
#[derive(Debug, Clone)]
pub struct Ava {
    attr: String,
    value: String,
}

impl Ava {
    /// The attribute type as written.
    pub fn attr(&self) -> &str {
        &self.attr
    }

    /// The unescaped value.
    pub fn value(&self) -> &str {
        &self.value
    }

    fn normalized(&self) -> String {
        let value = self
            .value
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        format!("{}={}", self.attr.to_ascii_lowercase(), escape_value(&value))
    }
}

/// A relative distinguished name: one or more AVAs joined with `+`.
#[derive(Debug, Clone)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    /// The attribute/value pairs of this RDN.
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// The value for `attr` in this RDN (case-insensitive type match).
    pub fn value_of(&self, attr: &str) -> Option<&str> {
        self.avas
            .iter()
            .find(|ava| ava.attr.eq_ignore_ascii_case(attr))
            .map(|ava| ava.value.as_str())
    }

    fn normalized(&self) -> String {
        // Multi-valued RDNs are unordered, so sort the parts.
        let mut parts: Vec<String> = self.avas.iter().map(Ava::normalized).collect();
        parts.sort();
        parts.join("+")
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.attr, escape_value(&ava.value))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DistinguishedName
// ---------------------------------------------------------------------------

/// A parsed distinguished name, most specific RDN first.
#[derive(Debug, Clone)]
pub struct DistinguishedName {
    rdns: Vec<Rdn>,
    normalized: String,
}

impl DistinguishedName {
    /// Parse the RFC 4514 string form.
    pub fn parse(input: &str) -> Result<Self, DnError> {
        let rdns = Parser::new(input).parse()?;
        Ok(Self::from_rdns(rdns))
    }

    fn from_rdns(rdns: Vec<Rdn>) -> Self {
        let normalized = rdns
            .iter()
            .map(Rdn::normalized)
            .collect::<Vec<_>>()
            .join(",");
        Self { rdns, normalized }
    }

    /// The RDNs, most specific first.
    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// Canonical comparison key.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Value of `attr` in the leading RDN, e.g. the `cn` of a group DN.
    pub fn first_value(&self, attr: &str) -> Option<&str> {
        self.rdns.first().and_then(|rdn| rdn.value_of(attr))
    }

    /// The DN with the leading RDN removed, or `None` for a single-RDN DN.
    pub fn parent(&self) -> Option<Self> {
        if self.rdns.len() <= 1 {
            return None;
        }
        Some(Self::from_rdns(self.rdns[1..].to_vec()))
    }

    /// Whether this DN equals `base` or lies beneath it.
    pub fn is_within(&self, base: &DistinguishedName) -> bool {
        let n = base.rdns.len();
        if n > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - n;
        self.rdns[offset..]
            .iter()
            .zip(&base.rdns)
            .all(|(a, b)| a.normalized() == b.normalized())
    }

    /// Prepend an RDN `attr=value` (value is escaped as needed).
    pub fn child(&self, attr: &str, value: &str) -> Result<Self, DnError> {
        if !is_valid_attribute_type(attr) {
            return Err(DnError::InvalidAttributeType(attr.to_string()));
        }
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(Rdn {
            avas: vec![Ava {
                attr: attr.to_string(),
                value: value.to_string(),
            }],
        });
        rdns.extend(self.rdns.iter().cloned());
        Ok(Self::from_rdns(rdns))
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for DistinguishedName {}

impl Hash for DistinguishedName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl PartialOrd for DistinguishedName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistinguishedName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl FromStr for DistinguishedName {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DistinguishedName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DistinguishedName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(|e| serde::de::Error::custom(format!("'{}': {}", raw, e)))
    }
}

/// Escape a value for the RFC 4514 string form.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let needs = ESCAPE_ANYWHERE.contains(&c)
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if c == '\0' {
            out.push_str("\\00");
        } else if needs {
            out.push('\\');
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a str,
    rdns: Vec<Rdn>,
    avas: Vec<Ava>,
    attr: String,
    /// Value characters with an "escaped" flag so unescaped edge whitespace
    /// can be trimmed while `\ ` survives.
    value: Vec<(char, bool)>,
    pending: Vec<u8>,
    in_value: bool,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            rdns: Vec::new(),
            avas: Vec::new(),
            attr: String::new(),
            value: Vec::new(),
            pending: Vec::new(),
            in_value: false,
        }
    }

    fn parse(mut self) -> Result<Vec<Rdn>, DnError> {
        if self.input.trim().is_empty() {
            return Err(DnError::Empty);
        }

        let mut chars = self.input.char_indices().peekable();
        while let Some((pos, c)) = chars.next() {
            if !self.in_value {
                match c {
                    '=' => self.in_value = true,
                    ',' | '+' => {
                        if self.attr.trim().is_empty() && self.avas.is_empty() {
                            return Err(DnError::EmptyRdn(self.rdns.len()));
                        }
                        return Err(DnError::MissingEquals(self.attr.trim().to_string()));
                    }
                    _ => self.attr.push(c),
                }
                continue;
            }

            match c {
                '\\' => {
                    let Some((_, next)) = chars.next() else {
                        return Err(DnError::InvalidEscape(pos));
                    };
                    if next.is_ascii_hexdigit() {
                        let Some((_, low)) = chars.next_if(|(_, l)| l.is_ascii_hexdigit()) else {
                            return Err(DnError::InvalidEscape(pos));
                        };
                        let hex = format!("{}{}", next, low);
                        let byte =
                            u8::from_str_radix(&hex, 16).map_err(|_| DnError::InvalidEscape(pos))?;
                        self.pending.push(byte);
                    } else if ESCAPABLE.contains(&next) {
                        self.flush_pending(pos)?;
                        self.value.push((next, true));
                    } else {
                        return Err(DnError::InvalidEscape(pos));
                    }
                }
                ',' => {
                    self.flush_pending(pos)?;
                    self.finish_ava()?;
                    self.finish_rdn();
                }
                '+' => {
                    self.flush_pending(pos)?;
                    self.finish_ava()?;
                }
                '"' | '<' | '>' | ';' => {
                    return Err(DnError::UnescapedSpecial { ch: c, pos });
                }
                _ => {
                    self.flush_pending(pos)?;
                    self.value.push((c, false));
                }
            }
        }

        if !self.in_value {
            if self.attr.trim().is_empty() {
                return Err(DnError::EmptyRdn(self.rdns.len()));
            }
            return Err(DnError::MissingEquals(self.attr.trim().to_string()));
        }
        self.flush_pending(self.input.len())?;
        self.finish_ava()?;
        self.finish_rdn();
        Ok(self.rdns)
    }

    fn flush_pending(&mut self, pos: usize) -> Result<(), DnError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.pending);
        let text = String::from_utf8(bytes).map_err(|_| DnError::InvalidEscape(pos))?;
        self.value.extend(text.chars().map(|c| (c, true)));
        Ok(())
    }

    fn finish_ava(&mut self) -> Result<(), DnError> {
        let attr = self.attr.trim().to_string();
        if !is_valid_attribute_type(&attr) {
            return Err(DnError::InvalidAttributeType(attr));
        }

        let value = std::mem::take(&mut self.value);
        let start = value
            .iter()
            .position(|(c, escaped)| *escaped || !c.is_whitespace())
            .unwrap_or(value.len());
        let end = value
            .iter()
            .rposition(|(c, escaped)| *escaped || !c.is_whitespace())
            .map_or(start, |i| i + 1);
        let value: String = value[start..end].iter().map(|(c, _)| *c).collect();

        self.avas.push(Ava { attr, value });
        self.attr.clear();
        self.in_value = false;
        Ok(())
    }

    fn finish_rdn(&mut self) {
        let avas = std::mem::take(&mut self.avas);
        self.rdns.push(Rdn { avas });
    }
}
