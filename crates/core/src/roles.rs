//! Directory group to application role mapping.
//!
//! The mapping is keyed by group DN. Keys are compared in normalized form, so
//! the case and spacing of a configured key does not have to match what the
//! server returns in the group attribute. The keys as written are kept for
//! display.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::config::{RegistrationConfig, RolesConfig};
use crate::dn::DistinguishedName;
use crate::errors::RoleMappingError;

/// One configured group and the roles it grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRoles {
    key: String,
    group: DistinguishedName,
    roles: Vec<String>,
}

impl GroupRoles {
    /// The key exactly as configured.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn group(&self) -> &DistinguishedName {
        &self.group
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }
}

/// Immutable table of group DN to role names, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMapping {
    entries: Vec<GroupRoles>,
    index: HashMap<String, usize>,
}

impl RoleMapping {
    /// Build a mapping from `(group DN, roles)` pairs.
    ///
    /// Fails on a key that is not a DN, on two keys naming the same group,
    /// and on an empty (or blank) role name.
    pub fn from_entries<I, K, R, S>(entries: I) -> Result<Self, RoleMappingError>
    where
        I: IntoIterator<Item = (K, R)>,
        K: Into<String>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut mapping = Self::default();
        for (key, roles) in entries {
            mapping.push(key.into(), roles.into_iter().map(Into::into).collect())?;
        }
        Ok(mapping)
    }

    fn push(&mut self, key: String, roles: Vec<String>) -> Result<(), RoleMappingError> {
        let group = DistinguishedName::parse(&key).map_err(|source| {
            RoleMappingError::InvalidGroupDn {
                key: key.clone(),
                source,
            }
        })?;

        if roles.iter().any(|r| r.trim().is_empty()) {
            return Err(RoleMappingError::EmptyRoleName(key));
        }

        let normalized = group.normalized().to_string();
        if let Some(&existing) = self.index.get(&normalized) {
            return Err(RoleMappingError::DuplicateGroup {
                first: self.entries[existing].key.clone(),
                second: key,
            });
        }

        let mut unique: Vec<String> = Vec::with_capacity(roles.len());
        for role in roles {
            let role = role.trim().to_string();
            if !unique.contains(&role) {
                unique.push(role);
            }
        }

        self.index.insert(normalized, self.entries.len());
        self.entries.push(GroupRoles {
            key,
            group,
            roles: unique,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &GroupRoles> {
        self.entries.iter()
    }

    /// Roles granted to `group`, if the group is mapped.
    pub fn get(&self, group: &DistinguishedName) -> Option<&[String]> {
        self.index
            .get(group.normalized())
            .map(|&i| self.entries[i].roles.as_slice())
    }

    /// Every distinct role name the mapping can grant, in first-seen order.
    pub fn role_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for role in self.entries.iter().flat_map(|e| e.roles.iter()) {
            if !names.contains(&role.as_str()) {
                names.push(role);
            }
        }
        names
    }

    /// Union of the roles of every mapped group in `groups`.
    ///
    /// Values that are not DNs, or are DNs the mapping does not mention, grant
    /// nothing. Roles come back deduplicated in mapping order.
    pub fn roles_for_groups<I, S>(&self, groups: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hits = vec![false; self.entries.len()];
        for group in groups {
            let raw = group.as_ref();
            match DistinguishedName::parse(raw) {
                Ok(dn) => match self.index.get(dn.normalized()) {
                    Some(&i) => hits[i] = true,
                    None => debug!(group = raw, "group has no role mapping"),
                },
                Err(e) => debug!(group = raw, error = %e, "ignoring unparsable group value"),
            }
        }

        let mut roles: Vec<String> = Vec::new();
        for (entry, _) in self.entries.iter().zip(&hits).filter(|(_, hit)| **hit) {
            for role in &entry.roles {
                if !roles.contains(role) {
                    roles.push(role.clone());
                }
            }
        }
        roles
    }
}

impl Serialize for RoleMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.key, &entry.roles)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RoleMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = RoleMapping;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of group DN to a list of role names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RoleMapping, A::Error> {
                let mut mapping = RoleMapping::default();
                while let Some((key, roles)) = access.next_entry::<String, Vec<String>>()? {
                    mapping.push(key, roles).map_err(serde::de::Error::custom)?;
                }
                Ok(mapping)
            }
        }

        deserializer.deserialize_map(MappingVisitor)
    }
}

// ---------------------------------------------------------------------------
// Role calculation
// ---------------------------------------------------------------------------

impl RolesConfig {
    /// Roles for a user in `groups`.
    ///
    /// Mapped roles win. When no group matched, the registration default role
    /// is used so a newly registered user still gets something.
    pub fn calculate_roles<I, S>(&self, groups: I, registration: &RegistrationConfig) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mapped = self.mapping.roles_for_groups(groups);
        if !mapped.is_empty() {
            return mapped;
        }
        let fallback = registration.default_role.trim();
        if fallback.is_empty() {
            Vec::new()
        } else {
            debug!(role = fallback, "no mapped group, using default role");
            vec![fallback.to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMINS: &str = "cn=airflow-admins,ou=groups,dc=example,dc=org";
    const USERS: &str = "cn=airflow-users,ou=groups,dc=example,dc=org";
    const VIEWERS: &str = "cn=airflow-viewers,ou=groups,dc=example,dc=org";

    fn mapping() -> RoleMapping {
        RoleMapping::from_entries([
            (ADMINS, vec!["Admin"]),
            (USERS, vec!["User"]),
            (VIEWERS, vec!["Viewer"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_roles_for_groups() {
        let m = mapping();
        assert_eq!(m.len(), 3);
        assert_eq!(m.roles_for_groups([USERS]), vec!["User"]);
        assert_eq!(m.roles_for_groups([VIEWERS, ADMINS]), vec!["Admin", "Viewer"]);
        assert!(m.roles_for_groups(["cn=other,dc=example,dc=org"]).is_empty());
        assert!(m.roles_for_groups(["not a dn"]).is_empty());
        assert!(m.roles_for_groups(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_lookup_is_normalized() {
        let m = mapping();
        let roles = m.roles_for_groups(["CN=Airflow-Admins, OU=Groups, DC=Example, DC=Org"]);
        assert_eq!(roles, vec!["Admin"]);
    }

    #[test]
    fn test_roles_deduplicated() {
        let m = RoleMapping::from_entries([
            ("cn=a,dc=example", vec!["User", "Op"]),
            ("cn=b,dc=example", vec!["Op", "User", "Op"]),
        ])
        .unwrap();
        assert_eq!(
            m.roles_for_groups(["cn=b,dc=example", "cn=a,dc=example"]),
            vec!["User", "Op"]
        );
        assert_eq!(m.role_names(), vec!["User", "Op"]);
    }

    #[test]
    fn test_rejects_invalid_key() {
        let err = RoleMapping::from_entries([("airflow-admins", vec!["Admin"])]).unwrap_err();
        assert!(matches!(err, RoleMappingError::InvalidGroupDn { ref key, .. } if key == "airflow-admins"));
    }

    #[test]
    fn test_rejects_duplicate_group() {
        let err = RoleMapping::from_entries([
            ("cn=admins,dc=example", vec!["Admin"]),
            ("CN=Admins, DC=example", vec!["Op"]),
        ])
        .unwrap_err();
        assert!(matches!(err, RoleMappingError::DuplicateGroup { .. }));
    }

    #[test]
    fn test_rejects_empty_role() {
        let err = RoleMapping::from_entries([("cn=admins,dc=example", vec!["Admin", "  "])])
            .unwrap_err();
        assert!(matches!(err, RoleMappingError::EmptyRoleName(_)));
    }

    #[test]
    fn test_deserialize_keeps_order_and_keys() {
        #[derive(Deserialize)]
        struct Wrapper {
            mapping: RoleMapping,
        }
        let w: Wrapper = toml::from_str(
            r#"
[mapping]
"cn=zeta,dc=example" = ["Z"]
"CN=Alpha,DC=example" = ["A"]
"#,
        )
        .unwrap();
        let keys: Vec<&str> = w.mapping.iter().map(GroupRoles::key).collect();
        assert_eq!(keys, vec!["cn=zeta,dc=example", "CN=Alpha,DC=example"]);

        let json = serde_json::to_string(&w.mapping).unwrap();
        assert_eq!(json, r#"{"cn=zeta,dc=example":["Z"],"CN=Alpha,DC=example":["A"]}"#);
    }

    #[test]
    fn test_deserialize_reports_bad_key() {
        #[derive(Debug, Deserialize)]
        struct Wrapper {
            #[allow(dead_code)]
            mapping: RoleMapping,
        }
        let err = toml::from_str::<Wrapper>("[mapping]\n\"admins\" = [\"Admin\"]\n").unwrap_err();
        assert!(err.to_string().contains("admins"));
    }

    #[test]
    fn test_calculate_roles_fallback() {
        let roles = RolesConfig {
            mapping: mapping(),
            ..Default::default()
        };
        let registration = RegistrationConfig {
            enabled: true,
            default_role: "Viewer".into(),
        };

        assert_eq!(roles.calculate_roles([ADMINS], &registration), vec!["Admin"]);
        assert_eq!(
            roles.calculate_roles(["cn=nobody,dc=example,dc=org"], &registration),
            vec!["Viewer"]
        );

        let no_default = RegistrationConfig {
            enabled: true,
            default_role: String::new(),
        };
        assert!(roles
            .calculate_roles(Vec::<&str>::new(), &no_default)
            .is_empty());
    }
}
