//! Token classification and the operation → permission-level policy.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use hb_domain::agent::{Agent, PermissionLevel};
use hb_domain::{Error, Result};
use hb_store::Store;

/// Token-less methods. The setup pair is live only until setup completes;
/// `boss.verify` always is.
pub const BOOTSTRAP_METHODS: &[&str] = &["setup.check", "setup.execute", "boss.verify"];

#[derive(Debug, Clone)]
pub enum Identity {
    Boss,
    Agent(Box<Agent>),
}

impl Identity {
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Identity::Boss => None,
            Identity::Agent(agent) => Some(&agent.name),
        }
    }

    pub fn level(&self) -> PermissionLevel {
        match self {
            Identity::Boss => PermissionLevel::Boss,
            Identity::Agent(agent) => agent.permission_level,
        }
    }

    pub fn is_boss(&self) -> bool {
        matches!(self, Identity::Boss)
    }
}

/// Hex SHA-256 of a token, the at-rest form of the boss credential.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time check of `token` against the stored boss hash.
pub fn verify_boss(store: &Store, token: &str) -> Result<bool> {
    let Some(stored) = store.get_config(hb_store::config_keys::BOSS_TOKEN_HASH)? else {
        return Ok(false);
    };
    let candidate = hash_token(token);
    Ok(candidate.as_bytes().ct_eq(stored.as_bytes()).into())
}

/// Classify a token: boss hash match, else agent token, else `auth-error`.
pub fn classify(store: &Store, token: &str) -> Result<Identity> {
    if verify_boss(store, token)? {
        return Ok(Identity::Boss);
    }
    if let Some(agent) = store.get_agent_by_token(token)? {
        return Ok(Identity::Agent(Box::new(agent)));
    }
    Err(Error::Auth("unknown token".into()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps operation names to required minimum levels. Operations missing from
/// the table require `boss` (safe by default).
pub struct PermissionPolicy {
    requirements: HashMap<String, PermissionLevel>,
}

impl PermissionPolicy {
    /// The built-in table; the `permission_policy` config document overlays
    /// it entry by entry.
    pub fn defaults() -> Self {
        use PermissionLevel::*;
        let table: &[(&str, PermissionLevel)] = &[
            ("envelope.send", Restricted),
            ("envelope.list", Restricted),
            ("envelope.get", Restricted),
            ("cron.create", Restricted),
            ("cron.list", Restricted),
            ("cron.get", Restricted),
            ("cron.enable", Restricted),
            ("cron.disable", Restricted),
            ("cron.delete", Restricted),
            ("reaction.set", Restricted),
            ("agent.register", Boss),
            ("agent.set", Privileged),
            ("agent.list", Restricted),
            ("agent.bind", Privileged),
            ("agent.unbind", Privileged),
            ("agent.status", Restricted),
            ("agent.refresh", Boss),
            ("agent.abort", Boss),
            ("agent.delete", Boss),
            ("agent.self", Restricted),
            ("agent.session-policy.set", Privileged),
            ("daemon.status", Boss),
            ("daemon.start", Boss),
            ("daemon.stop", Boss),
            ("daemon.ping", Standard),
            ("daemon.time", Standard),
        ];
        PermissionPolicy {
            requirements: table
                .iter()
                .map(|(op, level)| (op.to_string(), *level))
                .collect(),
        }
    }

    /// Load the effective policy: defaults overlaid with the persisted
    /// `permission_policy` JSON document (operation → level).
    pub fn load(store: &Store) -> Self {
        let mut policy = Self::defaults();
        let Ok(Some(raw)) = store.get_config(hb_store::config_keys::PERMISSION_POLICY) else {
            return policy;
        };
        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(overrides) => {
                for (op, level) in overrides {
                    match level.parse::<PermissionLevel>() {
                        Ok(level) => {
                            policy.requirements.insert(op, level);
                        }
                        Err(_) => {
                            tracing::warn!(op = %op, level = %level, "ignoring bad permission_policy entry");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable permission_policy document");
            }
        }
        policy
    }

    pub fn required(&self, method: &str) -> PermissionLevel {
        self.requirements
            .get(method)
            .copied()
            .unwrap_or(PermissionLevel::Boss)
    }

    pub fn authorize(&self, identity: &Identity, method: &str) -> Result<()> {
        let required = self.required(method);
        if identity.level() >= required {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "'{method}' requires {required}, token has {}",
                identity.level()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::agent::Provider;

    fn agent_with_level(store: &Store, name: &str, level: PermissionLevel) -> Agent {
        let agent = Agent {
            name: name.to_string(),
            token: format!("tok-{name}"),
            description: None,
            workspace: None,
            provider: Provider::Claude,
            model: None,
            reasoning_effort: None,
            permission_level: level,
            session_policy: None,
            created_at: 1,
            last_seen_at: None,
            metadata: serde_json::Map::new(),
            session_opened_at: None,
            refresh_requested: false,
        };
        store.create_agent(&agent).unwrap();
        agent
    }

    #[test]
    fn boss_token_classification_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_config(
                hb_store::config_keys::BOSS_TOKEN_HASH,
                &hash_token("sekret"),
            )
            .unwrap();

        assert!(matches!(
            classify(&store, "sekret").unwrap(),
            Identity::Boss
        ));
        assert_eq!(
            classify(&store, "wrong").unwrap_err().kind(),
            "auth-error"
        );
    }

    #[test]
    fn agent_token_classification() {
        let store = Store::open_in_memory().unwrap();
        agent_with_level(&store, "nex", PermissionLevel::Standard);
        match classify(&store, "tok-nex").unwrap() {
            Identity::Agent(agent) => assert_eq!(agent.name, "nex"),
            other => panic!("expected agent identity, got {other:?}"),
        }
    }

    #[test]
    fn missing_operations_default_to_boss() {
        let policy = PermissionPolicy::defaults();
        assert_eq!(policy.required("daemon.reset"), PermissionLevel::Boss);
        assert_eq!(policy.required("envelope.send"), PermissionLevel::Restricted);
    }

    #[test]
    fn authorization_matches_level_ordering() {
        let store = Store::open_in_memory().unwrap();
        let policy = PermissionPolicy::defaults();
        agent_with_level(&store, "low", PermissionLevel::Restricted);
        let low = classify(&store, "tok-low").unwrap();

        assert!(policy.authorize(&low, "envelope.send").is_ok());
        assert_eq!(
            policy.authorize(&low, "daemon.ping").unwrap_err().kind(),
            "permission-denied"
        );
        assert_eq!(
            policy.authorize(&low, "agent.register").unwrap_err().kind(),
            "permission-denied"
        );
        assert!(policy.authorize(&Identity::Boss, "agent.register").is_ok());
        // The boss token satisfies even unknown (boss-default) operations.
        assert!(policy.authorize(&Identity::Boss, "anything.at.all").is_ok());
    }

    #[test]
    fn config_overlay_tightens_or_loosens() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_config(
                hb_store::config_keys::PERMISSION_POLICY,
                r#"{"envelope.send": "privileged", "daemon.time": "restricted"}"#,
            )
            .unwrap();
        let policy = PermissionPolicy::load(&store);
        assert_eq!(policy.required("envelope.send"), PermissionLevel::Privileged);
        assert_eq!(policy.required("daemon.time"), PermissionLevel::Restricted);
        // Untouched entries keep defaults.
        assert_eq!(policy.required("agent.delete"), PermissionLevel::Boss);
    }
}
