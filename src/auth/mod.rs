//! API-key authorization
//!
//! Role-gated and namespace-gated access. Rules come either from a JSON
//! table (`[{key, role, namespaces}]`) or from a legacy CSV of bare keys
//! (implicit role `admin`, namespaces `["*"]`). Key comparison is
//! constant-time across the whole rule table so a timing probe cannot
//! enumerate keys.

use serde::{Deserialize, Serialize};

use crate::encoding::sha256_hex;
use crate::error::{DeepMemError, Result};

/// Role rank: read < write < admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Admin,
}

impl Role {
    pub fn rank(&self) -> u8 {
        match self {
            Role::Read => 1,
            Role::Write => 2,
            Role::Admin => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::Write => "write",
            Role::Admin => "admin",
        }
    }
}

/// One entry of the API-key rule table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRule {
    pub key: String,
    pub role: Role,
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,
}

fn default_namespaces() -> Vec<String> {
    vec!["*".to_string()]
}

/// Authorization settings consumed by [`AuthRegistry::from_config`]
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Single legacy key (`API_KEY`)
    pub api_key: Option<String>,
    /// Legacy CSV of keys (`API_KEYS`)
    pub api_keys_csv: Option<String>,
    /// JSON rule table (`API_KEYS_JSON`)
    pub api_keys_json: Option<String>,
    /// Force authentication even with zero keys configured (`REQUIRE_API_KEY`)
    pub require_api_key: bool,
}

/// Authenticated request context
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// 12-hex sha256 prefix of the presented key; None when auth is open
    pub key_id: Option<String>,
    pub role: Role,
    pub namespaces: Vec<String>,
}

impl AuthContext {
    /// Context used when no keys are configured and auth is not required
    pub fn open() -> Self {
        Self {
            key_id: None,
            role: Role::Admin,
            namespaces: vec!["*".to_string()],
        }
    }

    /// Whether this context may touch the given namespace
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.namespaces
            .iter()
            .any(|ns| ns == "*" || ns == namespace)
    }

    /// Error unless the namespace is allowed
    pub fn assert_namespace(&self, namespace: &str) -> Result<()> {
        if self.allows_namespace(namespace) {
            Ok(())
        } else {
            Err(DeepMemError::ForbiddenNamespace(namespace.to_string()))
        }
    }

    /// Stable requester id for audit entries; never the raw key
    pub fn audit_key_id(&self) -> &str {
        self.key_id.as_deref().unwrap_or("anonymous")
    }
}

/// Parsed rule table plus the open/closed switch
#[derive(Debug)]
pub struct AuthRegistry {
    rules: Vec<ApiKeyRule>,
    required: bool,
}

impl AuthRegistry {
    /// Build the registry. Fails closed: `require_api_key` with zero
    /// configured keys is a configuration error.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut rules: Vec<ApiKeyRule> = Vec::new();

        if let Some(ref json) = config.api_keys_json {
            if !json.trim().is_empty() {
                rules = serde_json::from_str(json).map_err(|e| {
                    DeepMemError::Config(format!("API_KEYS_JSON is not a valid rule table: {}", e))
                })?;
                for rule in &rules {
                    if rule.key.is_empty() {
                        return Err(DeepMemError::Config(
                            "API_KEYS_JSON contains an empty key".to_string(),
                        ));
                    }
                }
            }
        }

        if rules.is_empty() {
            let mut legacy: Vec<String> = Vec::new();
            if let Some(ref key) = config.api_key {
                if !key.trim().is_empty() {
                    legacy.push(key.trim().to_string());
                }
            }
            if let Some(ref csv) = config.api_keys_csv {
                legacy.extend(
                    csv.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from),
                );
            }
            rules = legacy
                .into_iter()
                .map(|key| ApiKeyRule {
                    key,
                    role: Role::Admin,
                    namespaces: default_namespaces(),
                })
                .collect();
        }

        let required = !rules.is_empty() || config.require_api_key;
        if config.require_api_key && rules.is_empty() {
            return Err(DeepMemError::Config(
                "REQUIRE_API_KEY is set but no API keys are configured".to_string(),
            ));
        }

        Ok(Self { rules, required })
    }

    /// Registry that accepts everything (tests, dev mode)
    pub fn open() -> Self {
        Self {
            rules: Vec::new(),
            required: false,
        }
    }

    pub fn required(&self) -> bool {
        self.required
    }

    /// Authenticate `x-api-key` and enforce the minimum role.
    /// Unknown key → 401 unauthorized; known key below `min` → 403 forbidden.
    pub fn authorize(&self, presented: Option<&str>, min: Role) -> Result<AuthContext> {
        if !self.required {
            return Ok(AuthContext::open());
        }
        let presented = presented.ok_or(DeepMemError::Unauthorized)?;

        // Compare against every rule so timing does not depend on which
        // entry (if any) matches.
        let mut matched: Option<&ApiKeyRule> = None;
        for rule in &self.rules {
            if constant_time_eq(presented.as_bytes(), rule.key.as_bytes()) && matched.is_none() {
                matched = Some(rule);
            }
        }

        let rule = matched.ok_or(DeepMemError::Unauthorized)?;
        if rule.role.rank() < min.rank() {
            return Err(DeepMemError::Forbidden);
        }
        Ok(AuthContext {
            key_id: Some(key_id(&rule.key)),
            role: rule.role,
            namespaces: rule.namespaces.clone(),
        })
    }
}

/// 12-hex sha256 prefix identifying a key in logs and audit entries
pub fn key_id(key: &str) -> String {
    sha256_hex(key.as_bytes())[..12].to_string()
}

/// Constant-time equality with padded length comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u8;
    for i in 0..max {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}
