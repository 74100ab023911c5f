//! LDAP search filters (RFC 4515 subset).
//!
//! Filters are built in code for user lookups and parsed from the optional
//! operator-supplied `search_filter`. Every item type is parsed and rendered
//! back unchanged; [`Filter::matches`] evaluates the ones that make sense
//! without a schema.

use std::cmp::Ordering;
use std::fmt;

use crate::directory::DirectoryEntry;
use crate::errors::FilterError;

/// A search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal {
        attr: String,
        value: String,
    },
    GreaterOrEqual {
        attr: String,
        value: String,
    },
    LessOrEqual {
        attr: String,
        value: String,
    },
    Approx {
        attr: String,
        value: String,
    },
    Present(String),
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    /// `(attr:dn:rule:=value)`; at least one of `attr` and `rule` is set.
    Extensible {
        attr: Option<String>,
        dn_attrs: bool,
        rule: Option<String>,
        value: String,
    },
}

impl Filter {
    /// `(attr=value)` with `value` taken literally.
    pub fn equality(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equal {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// Conjunction; a single operand is returned unwrapped.
    pub fn and(mut filters: Vec<Filter>) -> Self {
        if filters.len() == 1 {
            return filters.remove(0);
        }
        Self::And(filters)
    }

    /// The filter used to find a user entry:
    /// `(&<base>(<uid_field>=<username>))`, or just the equality when there
    /// is no base filter.
    pub fn user_lookup(uid_field: &str, username: &str, base: Option<&Filter>) -> Self {
        let by_uid = Self::equality(uid_field, username);
        match base {
            Some(base) => Self::and(vec![base.clone(), by_uid]),
            None => by_uid,
        }
    }

    /// Parse a filter string. A bare `attr=value` without parentheses is
    /// accepted.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FilterError::Empty);
        }
        let owned;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({})", trimmed);
            owned.as_str()
        };

        let mut parser = FilterParser {
            chars: text.chars().collect(),
            pos: 0,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.chars.len() {
            return Err(FilterError::Trailing(parser.pos));
        }
        Ok(filter)
    }

    /// Evaluate the filter against an entry. String matching is
    /// case-insensitive, as for the usual `caseIgnoreMatch` attributes.
    /// Ordering compares integers numerically and anything else as text.
    /// Extensible matches with a matching rule never match here.
    pub fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Self::Not(inner) => !inner.matches(entry),
            Self::Equal { attr, value } | Self::Approx { attr, value } => {
                equal_match(entry, attr, value)
            }
            Self::Extensible {
                attr: Some(attr),
                rule: None,
                value,
                ..
            } => equal_match(entry, attr, value),
            Self::Extensible { .. } => false,
            Self::GreaterOrEqual { attr, value } => entry
                .values(attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Less),
            Self::LessOrEqual { attr, value } => entry
                .values(attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Greater),
            Self::Present(attr) => !entry.values(attr).is_empty(),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => entry
                .values(attr)
                .iter()
                .any(|v| substring_match(&v.to_lowercase(), initial, any, last)),
        }
    }
}

fn equal_match(entry: &DirectoryEntry, attr: &str, value: &str) -> bool {
    let value = value.to_lowercase();
    entry.values(attr).iter().any(|v| v.to_lowercase() == value)
}

fn compare_values(stored: &str, asserted: &str) -> Ordering {
    match (stored.trim().parse::<i64>(), asserted.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => stored.to_lowercase().cmp(&asserted.to_lowercase()),
    }
}

fn substring_match(
    value: &str,
    initial: &Option<String>,
    any: &[String],
    last: &Option<String>,
) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        match rest.strip_prefix(initial.to_lowercase().as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last.to_lowercase().as_str()),
        None => true,
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(filters) => {
                f.write_str("(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Self::Or(filters) => {
                f.write_str("(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Self::Not(inner) => write!(f, "(!{})", inner),
            Self::Equal { attr, value } => {
                write!(f, "({}={})", attr, escape_filter_value(value))
            }
            Self::GreaterOrEqual { attr, value } => {
                write!(f, "({}>={})", attr, escape_filter_value(value))
            }
            Self::LessOrEqual { attr, value } => {
                write!(f, "({}<={})", attr, escape_filter_value(value))
            }
            Self::Approx { attr, value } => {
                write!(f, "({}~={})", attr, escape_filter_value(value))
            }
            Self::Extensible {
                attr,
                dn_attrs,
                rule,
                value,
            } => {
                f.write_str("(")?;
                if let Some(attr) = attr {
                    f.write_str(attr)?;
                }
                if *dn_attrs {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_filter_value(value))
            }
            Self::Present(attr) => write!(f, "({}=*)", attr),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    f.write_str(&escape_filter_value(initial))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape_filter_value(part))?;
                }
                if let Some(last) = last {
                    f.write_str(&escape_filter_value(last))?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Escape an assertion value so user input cannot alter the filter.
pub fn escape_filter_value(value: &str) -> String {
    ldap3::ldap_escape(value).into_owned()
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct FilterParser {
    chars: Vec<char>,
    pos: usize,
}

impl FilterParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expect(&mut self, want: char) -> Result<(), FilterError> {
        match self.peek() {
            Some(c) if c == want => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(FilterError::Unexpected {
                found: format!("'{}'", c),
                pos: self.pos,
            }),
            None => Err(FilterError::UnexpectedEnd),
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterError> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(FilterError::UnexpectedEnd),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut filters = Vec::new();
        while self.peek() == Some('(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return match self.peek() {
                Some(c) => Err(FilterError::Unexpected {
                    found: format!("'{}'", c),
                    pos: self.pos,
                }),
                None => Err(FilterError::UnexpectedEnd),
            };
        }
        Ok(filters)
    }

    fn unexpected(&self, pos: usize) -> FilterError {
        match self.chars.get(pos) {
            Some(c) => FilterError::Unexpected {
                found: format!("'{}'", c),
                pos,
            },
            None => FilterError::UnexpectedEnd,
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek().filter(|c| pred(*c)) {
            out.push(c);
            self.pos += 1;
        }
        out
    }

    fn item(&mut self) -> Result<Filter, FilterError> {
        let start = self.pos;
        let attr = self.take_while(is_descr_char);
        if self.peek() == Some(':') {
            return self.extensible(attr, start);
        }
        if attr.is_empty() {
            return Err(self.unexpected(start));
        }

        let op = match (self.peek(), self.chars.get(self.pos + 1).copied()) {
            (Some('='), _) => '=',
            (Some(c @ ('>' | '<' | '~')), Some('=')) => {
                self.pos += 1;
                c
            }
            _ => return Err(self.unexpected(self.pos)),
        };
        self.pos += 1;

        let mut parts = self.assertion_value(op == '=')?;
        if op != '=' {
            let value = parts.remove(0);
            return Ok(match op {
                '>' => Filter::GreaterOrEqual { attr, value },
                '<' => Filter::LessOrEqual { attr, value },
                _ => Filter::Approx { attr, value },
            });
        }

        if parts.len() == 1 {
            let value = parts.remove(0);
            return Ok(Filter::Equal { attr, value });
        }
        if parts.len() == 2 && parts.iter().all(String::is_empty) {
            return Ok(Filter::Present(attr));
        }

        let last = parts.pop().filter(|s| !s.is_empty());
        let initial = Some(parts.remove(0)).filter(|s| !s.is_empty());
        let any = parts.into_iter().filter(|s| !s.is_empty()).collect();
        Ok(Filter::Substring {
            attr,
            initial,
            any,
            last,
        })
    }

    /// `[attr][:dn][:rule]:=value`, positioned at the first ':'.
    fn extensible(&mut self, attr: String, start: usize) -> Result<Filter, FilterError> {
        let mut dn_attrs = false;
        let mut rule: Option<String> = None;
        loop {
            self.expect(':')?;
            if self.peek() == Some('=') {
                self.pos += 1;
                break;
            }
            let at = self.pos;
            let token = self.take_while(is_descr_char);
            if token.is_empty() || rule.is_some() {
                return Err(self.unexpected(at));
            }
            if token.eq_ignore_ascii_case("dn") && !dn_attrs {
                dn_attrs = true;
            } else {
                rule = Some(token);
            }
        }
        if attr.is_empty() && rule.is_none() {
            return Err(self.unexpected(start));
        }

        let mut parts = self.assertion_value(false)?;
        Ok(Filter::Extensible {
            attr: Some(attr).filter(|a| !a.is_empty()),
            dn_attrs,
            rule,
            value: parts.remove(0),
        })
    }

    /// Read an assertion value up to the closing ')', decoding `\XX`
    /// escapes as UTF-8. With `substrings` the value is split on unescaped
    /// '*'; otherwise a '*' is an error. Always returns at least one part.
    fn assertion_value(&mut self, substrings: bool) -> Result<Vec<String>, FilterError> {
        let start = self.pos;
        let mut parts: Vec<Vec<u8>> = vec![Vec::new()];
        loop {
            match self.peek() {
                Some(')') => break,
                Some('(') => return Err(self.unexpected(self.pos)),
                Some('*') if substrings => {
                    parts.push(Vec::new());
                    self.pos += 1;
                }
                Some('*') => return Err(self.unexpected(self.pos)),
                Some('\\') => {
                    let at = self.pos;
                    let hex: String = self.chars.iter().skip(at + 1).take(2).collect();
                    if hex.len() != 2 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(FilterError::InvalidEscape(at));
                    }
                    let byte = u8::from_str_radix(&hex, 16).map_err(|_| FilterError::InvalidEscape(at))?;
                    if let Some(last) = parts.last_mut() {
                        last.push(byte);
                    }
                    self.pos += 3;
                }
                Some(c) => {
                    if let Some(last) = parts.last_mut() {
                        let mut buf = [0u8; 4];
                        last.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                    self.pos += 1;
                }
                None => return Err(FilterError::UnexpectedEnd),
            }
        }

        parts
            .into_iter()
            .map(|bytes| String::from_utf8(bytes).map_err(|_| FilterError::InvalidEscape(start)))
            .collect()
    }
}

fn is_descr_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> DirectoryEntry {
        DirectoryEntry::new("uid=jdoe,ou=people,dc=example,dc=org")
            .with_attr("uid", ["jdoe"])
            .with_attr("objectClass", ["top", "inetOrgPerson"])
            .with_attr("mail", ["John.Doe@example.org"])
    }

    #[test]
    fn test_user_lookup_escapes_input() {
        let base = Filter::parse("(objectClass=inetOrgPerson)").unwrap();
        let filter = Filter::user_lookup("uid", "j*doe)(uid=*", Some(&base));
        assert_eq!(
            filter.to_string(),
            r"(&(objectClass=inetOrgPerson)(uid=j\2adoe\29\28uid=\2a))"
        );
        assert_eq!(Filter::user_lookup("uid", "jdoe", None).to_string(), "(uid=jdoe)");
    }

    #[test]
    fn test_parse_compound() {
        let filter = Filter::parse("(&(objectClass=person)(|(uid=a*)(!(mail=*))))").unwrap();
        match &filter {
            Filter::And(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected And, got {:?}", other),
        }
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=person)(|(uid=a*)(!(mail=*))))"
        );
    }

    #[test]
    fn test_parse_bare_and_escapes() {
        let filter = Filter::parse("objectClass=inetOrgPerson").unwrap();
        assert_eq!(filter, Filter::equality("objectClass", "inetOrgPerson"));

        let filter = Filter::parse(r"(cn=a\2ab)").unwrap();
        assert_eq!(filter, Filter::equality("cn", "a*b"));
    }

    #[test]
    fn test_parse_utf8_escapes() {
        let filter = Filter::parse(r"(cn=Ren\c3\a9)").unwrap();
        assert_eq!(filter, Filter::equality("cn", "René"));
        assert_eq!(filter.to_string(), "(cn=René)");

        let entry = DirectoryEntry::new("cn=René,dc=example").with_attr("cn", ["René"]);
        assert!(filter.matches(&entry));

        let filter = Filter::parse(r"(cn=Ren\c3\a9*)").unwrap();
        assert!(filter.matches(&entry));

        assert!(matches!(Filter::parse(r"(cn=\c3)"), Err(FilterError::InvalidEscape(_))));
    }

    #[test]
    fn test_parse_ordering_and_approx() {
        for text in ["(uidNumber>=1000)", "(uidNumber<=2000)", "(sn~=smith)"] {
            assert_eq!(Filter::parse(text).unwrap().to_string(), text);
        }
        assert_eq!(
            Filter::parse("(uidNumber>=1000)").unwrap(),
            Filter::GreaterOrEqual {
                attr: "uidNumber".into(),
                value: "1000".into()
            }
        );
        assert!(matches!(Filter::parse("(uidNumber>=1*)"), Err(FilterError::Unexpected { .. })));
        assert!(matches!(Filter::parse("(uidNumber>1000)"), Err(FilterError::Unexpected { .. })));
    }

    #[test]
    fn test_parse_extensible() {
        let text = "(&(objectCategory=person)(!(userAccountControl:1.2.840.113556.1.4.803:=2)))";
        let filter = Filter::parse(text).unwrap();
        assert_eq!(filter.to_string(), text);

        assert_eq!(
            Filter::parse("(cn:dn:caseExactMatch:=Ops)").unwrap(),
            Filter::Extensible {
                attr: Some("cn".into()),
                dn_attrs: true,
                rule: Some("caseExactMatch".into()),
                value: "Ops".into(),
            }
        );
        assert_eq!(Filter::parse("(:dn:2.4.8.10:=x)").unwrap().to_string(), "(:dn:2.4.8.10:=x)");
        assert_eq!(Filter::parse("(cn:=Ops)").unwrap().to_string(), "(cn:=Ops)");
        assert!(Filter::parse("(:=x)").is_err());
        assert!(Filter::parse("(cn:a:b:=x)").is_err());
    }

    #[test]
    fn test_matches_ordering() {
        let e = DirectoryEntry::new("uid=jdoe,dc=example")
            .with_attr("uidNumber", ["1500"])
            .with_attr("sn", ["Doe"])
            .with_attr("userAccountControl", ["514"]);
        assert!(Filter::parse("(uidNumber>=1000)").unwrap().matches(&e));
        assert!(!Filter::parse("(uidNumber>=10000)").unwrap().matches(&e));
        assert!(Filter::parse("(uidNumber<=9999)").unwrap().matches(&e));
        assert!(Filter::parse("(sn~=doe)").unwrap().matches(&e));
        assert!(Filter::parse("(sn:=DOE)").unwrap().matches(&e));
        assert!(!Filter::parse("(userAccountControl:1.2.840.113556.1.4.803:=2)")
            .unwrap()
            .matches(&e));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Filter::parse(""), Err(FilterError::Empty));
        assert_eq!(Filter::parse("(uid=a"), Err(FilterError::UnexpectedEnd));
        assert!(matches!(Filter::parse("(&)"), Err(FilterError::Unexpected { .. })));
        assert!(matches!(Filter::parse("(uid=a)x"), Err(FilterError::Trailing(_))));
        assert!(matches!(Filter::parse(r"(uid=\zz)"), Err(FilterError::InvalidEscape(_))));
        assert!(matches!(Filter::parse("(=a)"), Err(FilterError::Unexpected { .. })));
    }

    #[test]
    fn test_matches() {
        let e = entry();
        assert!(Filter::parse("(uid=JDOE)").unwrap().matches(&e));
        assert!(Filter::parse("(objectClass=inetOrgPerson)").unwrap().matches(&e));
        assert!(Filter::parse("(mail=*)").unwrap().matches(&e));
        assert!(!Filter::parse("(telephoneNumber=*)").unwrap().matches(&e));
        assert!(Filter::parse("(mail=john*@example.org)").unwrap().matches(&e));
        assert!(Filter::parse("(mail=*doe*)").unwrap().matches(&e));
        assert!(!Filter::parse("(mail=jane*)").unwrap().matches(&e));
        assert!(Filter::parse("(&(uid=jdoe)(!(uid=other)))").unwrap().matches(&e));
        assert!(Filter::parse("(|(uid=nobody)(uid=jdoe))").unwrap().matches(&e));
    }
}
