//! Durable identifier for a managed Job: `<namespace>/<name>`.
//!
//! Kubernetes namespaces and object names are DNS-1123 strings, so `/` can
//! never appear inside either part and is safe as the join separator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SyncError;

pub const SEPARATOR: char = '/';

/// Composite `{namespace, name}` handle persisted by callers between runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    namespace: String,
    name: String,
}

impl ResourceId {
    /// Build an identifier, rejecting parts that would break the round trip.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, SyncError> {
        let namespace = namespace.into();
        let name = name.into();
        let raw = encode(&namespace, &name);
        check_part(&namespace, "namespace", &raw)?;
        check_part(&name, "name", &raw)?;
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn name(&self) -> &str { &self.name }

    /// Opaque string form, the only thing a caller needs to persist.
    pub fn encode(&self) -> String {
        encode(&self.namespace, &self.name)
    }

    pub fn decode(id: &str) -> Result<Self, SyncError> {
        let (namespace, name) = decode(id)?;
        Ok(Self { namespace, name })
    }
}

fn check_part(part: &str, what: &'static str, raw: &str) -> Result<(), SyncError> {
    if part.is_empty() {
        return Err(SyncError::MalformedIdentifier {
            op: None,
            id: raw.to_string(),
            reason: format!("{} is empty", what),
        });
    }
    if part.contains(SEPARATOR) {
        return Err(SyncError::MalformedIdentifier {
            op: None,
            id: raw.to_string(),
            reason: format!("{} contains '{}'", what, SEPARATOR),
        });
    }
    Ok(())
}

/// Join namespace and name. Callers are expected to pass DNS-1123 parts.
pub fn encode(namespace: &str, name: &str) -> String {
    format!("{}{}{}", namespace, SEPARATOR, name)
}

/// Split an encoded identifier back into `(namespace, name)`.
pub fn decode(id: &str) -> Result<(String, String), SyncError> {
    let parts: Vec<&str> = id.split(SEPARATOR).collect();
    match parts.as_slice() {
        [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
            Ok(((*namespace).to_string(), (*name).to_string()))
        }
        [_, _] => Err(SyncError::MalformedIdentifier {
            op: None,
            id: id.to_string(),
            reason: "namespace and name must both be non-empty".into(),
        }),
        [_] => Err(SyncError::MalformedIdentifier {
            op: None,
            id: id.to_string(),
            reason: format!("missing '{}' separator (expect namespace{}name)", SEPARATOR, SEPARATOR),
        }),
        _ => Err(SyncError::MalformedIdentifier {
            op: None,
            id: id.to_string(),
            reason: format!("'{}' occurs {} times, expected once", SEPARATOR, parts.len() - 1),
        }),
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, SEPARATOR, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_exact() {
        let pairs = [
            ("default", "tf-acc-test-x"),
            ("kube-system", "a"),
            ("ns-1", "job.with.dots"),
            ("x", "0123456789abcdefghijklmnopqrstuvwxyz-0123456789abcdefghijklmn"),
        ];
        for (ns, name) in pairs {
            let id = encode(ns, name);
            assert_eq!(decode(&id).unwrap(), (ns.to_string(), name.to_string()), "id={}", id);
            let typed = ResourceId::new(ns, name).unwrap();
            assert_eq!(ResourceId::decode(&typed.encode()).unwrap(), typed);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const LABEL: &str = "[a-z0-9]([a-z0-9-]{0,30}[a-z0-9])?";
        const SUBDOMAIN: &str = "[a-z0-9]([a-z0-9-]{0,20}[a-z0-9])?(\\.[a-z0-9]([a-z0-9-]{0,10}[a-z0-9])?){0,2}";

        proptest! {
            #[test]
            fn decode_inverts_encode(ns in LABEL, name in SUBDOMAIN) {
                let id = encode(&ns, &name);
                prop_assert_eq!(decode(&id).unwrap(), (ns.clone(), name.clone()));
                let typed = ResourceId::new(ns.as_str(), name.as_str()).unwrap();
                prop_assert_eq!(typed.to_string(), id);
                prop_assert_eq!(ResourceId::decode(&typed.encode()).unwrap(), typed);
            }

            #[test]
            fn decode_rejects_input_without_separator(raw in "[a-z0-9.-]{0,40}") {
                let is_malformed = matches!(decode(&raw), Err(SyncError::MalformedIdentifier { .. }));
                prop_assert!(is_malformed);
            }

            #[test]
            fn decode_rejects_repeated_separator(parts in prop::collection::vec(LABEL, 3..6)) {
                let raw = parts.join("/");
                let is_malformed = matches!(decode(&raw), Err(SyncError::MalformedIdentifier { .. }));
                prop_assert!(is_malformed, "{} decoded", raw);
            }
        }
    }

    #[test]
    fn decode_rejects_missing_or_repeated_separator() {
        let e = decode("no-separator").unwrap_err();
        assert!(matches!(e, SyncError::MalformedIdentifier { .. }));
        assert!(e.to_string().contains("missing"), "e={}", e);

        let e = decode("a/b/c").unwrap_err();
        assert!(e.to_string().contains("2 times"), "e={}", e);

        assert!(decode("/name").is_err());
        assert!(decode("ns/").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn new_rejects_parts_with_separator() {
        assert!(ResourceId::new("a/b", "c").is_err());
        assert!(ResourceId::new("a", "").is_err());
    }

    #[test]
    fn serde_uses_encoded_string() {
        let id = ResourceId::new("default", "hello").unwrap();
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"default/hello\"");
        let back: ResourceId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ResourceId>("\"broken\"").is_err());
    }
}
