//! Normalized user attributes for permission checks.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::auth::Claims;

/// Claims that may carry group or role memberships, in merge order.
const GROUP_CLAIMS: &[&str] = &["groups", "roles", "group", "role", "cognito:groups"];

/// The user attributes rule evaluation works on.
#[derive(Debug, Clone, Serialize)]
pub struct UserContext {
    /// Token subject
    pub user_id: String,
    /// Groups and roles, deduplicated in first-seen order
    pub groups: Vec<String>,
    /// OAuth scopes
    pub scopes: Vec<String>,
    /// Token issuer
    pub issuer: String,
    /// The validated claims this context was built from
    #[serde(skip)]
    pub claims: Arc<Claims>,
}

impl UserContext {
    /// Build a context from validated claims.
    #[must_use]
    pub fn from_claims(claims: Arc<Claims>) -> Self {
        Self {
            user_id: claims.sub.clone(),
            groups: groups_from_claims(&claims),
            scopes: claims.scopes().into_iter().map(str::to_string).collect(),
            issuer: claims.iss.clone(),
            claims,
        }
    }

    /// A context without a token, for policy dry-runs.
    #[must_use]
    pub fn synthetic(user_id: &str, groups: Vec<String>) -> Self {
        let claims = Arc::new(Claims::new(user_id, "urn:sonar-authgate:synthetic"));
        Self {
            user_id: user_id.to_string(),
            groups,
            scopes: Vec::new(),
            issuer: claims.iss.clone(),
            claims,
        }
    }

    /// Returns `true` if the user holds `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Groups and roles from every known claim, deduplicated in first-seen
/// order.
#[must_use]
pub fn groups_from_claims(claims: &Claims) -> Vec<String> {
    let mut groups: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !name.is_empty() && !groups.iter().any(|g| g == name) {
            groups.push(name.to_string());
        }
    };

    for claim in GROUP_CLAIMS {
        if let Some(value) = claims.get(claim) {
            for name in memberships(&value) {
                push(&name);
            }
        }
    }
    // Keycloak nests realm roles
    if let Some(Value::Array(roles)) = claims
        .extra
        .get("realm_access")
        .and_then(|v| v.get("roles"))
    {
        for role in roles.iter().filter_map(Value::as_str) {
            push(role);
        }
    }

    groups
}

/// Membership names from a claim value: arrays of strings, or a single
/// space/comma-delimited string.
fn memberships(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn claims_with(groups: Value, roles: Value) -> Arc<Claims> {
        let mut claims = Claims::new("alice", "https://idp.example.com");
        claims.groups = Some(groups);
        claims.roles = Some(roles);
        Arc::new(claims)
    }

    #[test]
    fn merges_groups_and_roles_preserving_first_seen_order() {
        // GIVEN: overlapping groups and roles
        let claims = claims_with(json!(["admin", "developer"]), json!(["admin", "qa"]));

        // WHEN: context is extracted
        let ctx = UserContext::from_claims(claims);

        // THEN: deduplicated, order preserved
        assert_eq!(ctx.groups, vec!["admin", "developer", "qa"]);
    }

    #[test]
    fn delimited_strings_are_split() {
        let claims = claims_with(json!("admin developer"), json!("qa,ops"));

        let ctx = UserContext::from_claims(claims);

        assert_eq!(ctx.groups, vec!["admin", "developer", "qa", "ops"]);
    }

    #[test]
    fn scopes_come_from_scope_claim() {
        let mut claims = Claims::new("alice", "https://idp.example.com");
        claims.scope = Some("sonarqube:read sonarqube:write".to_string());

        let ctx = UserContext::from_claims(Arc::new(claims));

        assert_eq!(ctx.scopes, vec!["sonarqube:read", "sonarqube:write"]);
        assert!(ctx.has_scope("sonarqube:write"));
        assert!(ctx.groups.is_empty());
    }

    #[test]
    fn missing_scope_yields_empty_list() {
        let ctx = UserContext::from_claims(Arc::new(Claims::new("bob", "https://idp.example.com")));

        assert!(ctx.scopes.is_empty());
        assert_eq!(ctx.user_id, "bob");
        assert_eq!(ctx.issuer, "https://idp.example.com");
    }

    #[test]
    fn keycloak_realm_roles_are_merged() {
        let mut claims = Claims::new("carol", "https://kc.example.com/realms/acme");
        claims.groups = Some(json!(["developer"]));
        claims
            .extra
            .insert("realm_access".to_string(), json!({"roles": ["viewer", "developer"]}));

        let ctx = UserContext::from_claims(Arc::new(claims));

        assert_eq!(ctx.groups, vec!["developer", "viewer"]);
    }
}
