//! Typed JWT claims.
//!
//! Well-known registered claims are typed fields; everything else (custom
//! provider claims, tenant ids, remapped claims) lives in [`Claims::extra`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Claims asserted by a validated bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id at the issuer).
    #[serde(default)]
    pub sub: String,
    /// Issuer URL.
    #[serde(default)]
    pub iss: String,
    /// Audience set (a single string in the token is normalized to one entry).
    #[serde(default, deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    /// Expiry (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Not-before (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// Issued-at (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Space-delimited OAuth scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// RFC 8707 resource indicator(s).
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<String>,
    /// Token id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Group memberships, raw (string, array of strings, or array of objects).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Value>,
    /// Role memberships, raw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Value>,
    /// All other claims.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// Minimal claims for a subject at an issuer.
    #[must_use]
    pub fn new(sub: impl Into<String>, iss: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            iss: iss.into(),
            aud: Vec::new(),
            exp: None,
            nbf: None,
            iat: None,
            scope: None,
            resource: Vec::new(),
            jti: None,
            groups: None,
            roles: None,
            extra: Map::new(),
        }
    }

    /// Scopes from the `scope` claim, split on whitespace.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if any token audience is in `expected`.
    #[must_use]
    pub fn audience_intersects(&self, expected: &[String]) -> bool {
        self.aud.iter().any(|a| expected.iter().any(|e| e == a))
    }

    /// Look up any claim by name, typed or extra.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        match name {
            "sub" => Some(Value::String(self.sub.clone())),
            "iss" => Some(Value::String(self.iss.clone())),
            "scope" => self.scope.clone().map(Value::String),
            "jti" => self.jti.clone().map(Value::String),
            "groups" => self.groups.clone(),
            "roles" => self.roles.clone(),
            other => self.extra.get(other).cloned(),
        }
    }

    /// String-valued extra claim.
    #[must_use]
    pub fn extra_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
    Null,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audience_accepts_string_or_array() {
        let single: Claims = serde_json::from_value(json!({"sub": "a", "iss": "i", "aud": "x"})).unwrap();
        let many: Claims = serde_json::from_value(json!({"sub": "a", "iss": "i", "aud": ["x", "y"]})).unwrap();

        assert_eq!(single.aud, vec!["x"]);
        assert_eq!(many.aud, vec!["x", "y"]);
        assert!(many.audience_intersects(&["y".to_string()]));
        assert!(!single.audience_intersects(&["y".to_string()]));
    }

    #[test]
    fn unknown_claims_land_in_extra() {
        let claims: Claims = serde_json::from_value(json!({
            "sub": "a",
            "iss": "i",
            "tid": "tenant-1",
            "https://example.com/roles": ["x"]
        }))
        .unwrap();

        assert_eq!(claims.extra_str("tid"), Some("tenant-1"));
        assert!(claims.get("https://example.com/roles").is_some());
    }

    #[test]
    fn scopes_split_on_whitespace() {
        let mut claims = Claims::new("a", "i");
        claims.scope = Some("sonarqube:read  sonarqube:write".to_string());

        assert_eq!(claims.scopes(), vec!["sonarqube:read", "sonarqube:write"]);
        assert!(Claims::new("a", "i").scopes().is_empty());
    }
}
