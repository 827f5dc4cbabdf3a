use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::{info, warn};

mod personal;

pub use personal::personal_auth;

type HmacSha1 = Hmac<Sha1>;

/// Realm signed tokens must carry in their second payload field.
pub const DEFAULT_REALM: &str = "janus";

/// Stored tokens are opaque strings; anything longer than this is refused.
const MAX_TOKEN_LEN: usize = 1024;

#[derive(Default)]
struct StoredState {
    tokens: HashSet<String>,
    /// Per-token plugin ACL. A token with no entry here has never been
    /// restricted and may access any plugin; an entry (even an empty one)
    /// limits access to exactly its members.
    allowed_plugins: HashMap<String, HashSet<String>>,
}

enum Mode {
    Stored(Mutex<StoredState>),
    Signed { secret: String },
}

/// Request authenticator, fixed at construction to one of two modes.
///
/// In stored mode valid tokens are pushed in by the controlling application
/// through the admin API and matched verbatim. In signed mode there is no
/// mutable state: the application signs `<payload>:<base64(HMAC-SHA1)>`
/// tokens that are verified against the shared secret.
pub struct TokenAuth {
    mode: Mode,
}

impl TokenAuth {
    pub fn stored() -> Self {
        info!("stored-token based authentication enabled");
        Self {
            mode: Mode::Stored(Mutex::new(StoredState::default())),
        }
    }

    pub fn signed(secret: impl Into<String>) -> Self {
        info!("signed-token based authentication enabled");
        Self {
            mode: Mode::Signed {
                secret: secret.into(),
            },
        }
    }

    pub fn is_stored_mode(&self) -> bool {
        matches!(self.mode, Mode::Stored(_))
    }

    /// Add a token to the stored set. Adding a known token is a no-op success.
    pub fn add_token(&self, token: &str) -> bool {
        let Mode::Stored(state) = &self.mode else {
            warn!("can't add token, stored-token authentication is not in use");
            return false;
        };
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return false;
        }
        let mut state = state.lock().unwrap();
        state.tokens.insert(token.to_string());
        true
    }

    /// Remove a token and purge its plugin ACL.
    pub fn remove_token(&self, token: &str) -> bool {
        let Mode::Stored(state) = &self.mode else {
            warn!("can't remove token, stored-token authentication is not in use");
            return false;
        };
        let mut state = state.lock().unwrap();
        state.allowed_plugins.remove(token);
        state.tokens.remove(token)
    }

    pub fn list_tokens(&self) -> Vec<String> {
        let Mode::Stored(state) = &self.mode else {
            return Vec::new();
        };
        let state = state.lock().unwrap();
        state.tokens.iter().cloned().collect()
    }

    /// Check a token for validity: membership in stored mode, signature and
    /// expiry in signed mode.
    pub fn check_token(&self, token: &str) -> bool {
        self.check_token_at(token, chrono::Utc::now().timestamp())
    }

    pub fn check_token_at(&self, token: &str, now: i64) -> bool {
        match &self.mode {
            Mode::Stored(state) => state.lock().unwrap().tokens.contains(token),
            Mode::Signed { secret } => {
                check_signature(secret, token, DEFAULT_REALM, now, None)
            }
        }
    }

    /// Grant a stored token access to a plugin package.
    pub fn allow_plugin(&self, token: &str, plugin: &str) -> bool {
        let Mode::Stored(state) = &self.mode else {
            warn!("can't allow plugin access, stored-token authentication is not in use");
            return false;
        };
        let mut state = state.lock().unwrap();
        if !state.tokens.contains(token) {
            return false;
        }
        state
            .allowed_plugins
            .entry(token.to_string())
            .or_default()
            .insert(plugin.to_string());
        true
    }

    /// Revoke a previously granted plugin permission. The (now possibly
    /// empty) ACL entry is kept, so the token stays restricted.
    pub fn disallow_plugin(&self, token: &str, plugin: &str) -> bool {
        let Mode::Stored(state) = &self.mode else {
            warn!("can't disallow plugin access, stored-token authentication is not in use");
            return false;
        };
        let mut state = state.lock().unwrap();
        if !state.tokens.contains(token) {
            return false;
        }
        if let Some(list) = state.allowed_plugins.get_mut(token) {
            list.remove(plugin);
        }
        true
    }

    /// Check whether a token may access the given plugin package.
    pub fn check_plugin(&self, token: &str, plugin: &str) -> bool {
        self.check_plugin_at(token, plugin, chrono::Utc::now().timestamp())
    }

    pub fn check_plugin_at(&self, token: &str, plugin: &str, now: i64) -> bool {
        match &self.mode {
            Mode::Stored(state) => {
                let state = state.lock().unwrap();
                if !state.tokens.contains(token) {
                    return false;
                }
                match state.allowed_plugins.get(token) {
                    // Never restricted: any plugin goes.
                    None => true,
                    Some(list) => list.contains(plugin),
                }
            }
            Mode::Signed { secret } => {
                check_signature(secret, token, DEFAULT_REALM, now, Some(plugin))
            }
        }
    }

    /// List the plugins a stored token is restricted to. Empty for unknown
    /// tokens and for tokens that were never restricted.
    pub fn list_plugins(&self, token: &str) -> Vec<String> {
        let Mode::Stored(state) = &self.mode else {
            return Vec::new();
        };
        let state = state.lock().unwrap();
        if !state.tokens.contains(token) {
            return Vec::new();
        }
        state
            .allowed_plugins
            .get(token)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Verify a `<payload>:<base64(HMAC-SHA1(secret, payload))>` token.
///
/// The payload is `<expiry_unix_seconds>,<realm>[,<descriptor>...]`; when
/// `descriptor` is given, some payload field beyond the first two must match
/// it exactly. Tokens whose expiry second has been reached are rejected.
fn check_signature(
    secret: &str,
    token: &str,
    realm: &str,
    now: i64,
    descriptor: Option<&str>,
) -> bool {
    // Exactly one payload and one signature part.
    let Some((payload, signature)) = token.split_once(':') else {
        return false;
    };
    if payload.is_empty() || signature.is_empty() || signature.contains(':') {
        return false;
    }
    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() < 2 {
        return false;
    }
    let Ok(expiry) = fields[0].parse::<i64>() else {
        return false;
    };
    if now >= expiry {
        return false;
    }
    if fields[1] != realm {
        return false;
    }
    if let Some(descriptor) = descriptor {
        if !fields[2..].iter().any(|field| *field == descriptor) {
            return false;
        }
    }
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    let expected = STANDARD.encode(mac.finalize().into_bytes());
    constant_time_eq(signature.as_bytes(), expected.as_bytes())
}

/// Byte-by-byte XOR-accumulating comparison, so equal-length mismatches
/// don't leak the matching prefix length through timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &str) -> String {
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload.as_bytes());
        format!("{}:{}", payload, STANDARD.encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn stored_token_membership() {
        let auth = TokenAuth::stored();
        assert!(auth.add_token("tok"));
        // Re-adding is idempotent.
        assert!(auth.add_token("tok"));
        assert!(auth.check_token("tok"));
        assert!(!auth.check_token("other"));
        assert!(auth.remove_token("tok"));
        assert!(!auth.check_token("tok"));
        assert!(!auth.remove_token("tok"));
    }

    #[test]
    fn stored_token_rejects_oversized() {
        let auth = TokenAuth::stored();
        let long = "x".repeat(MAX_TOKEN_LEN + 1);
        assert!(!auth.add_token(&long));
        assert!(auth.add_token(&"x".repeat(MAX_TOKEN_LEN)));
    }

    #[test]
    fn stored_plugin_acl() {
        let auth = TokenAuth::stored();
        auth.add_token("tok");
        assert!(auth.allow_plugin("tok", "janus.plugin.pushstream"));
        assert!(auth.check_plugin("tok", "janus.plugin.pushstream"));
        assert!(!auth.check_plugin("tok", "janus.plugin.other"));
        assert!(auth.disallow_plugin("tok", "janus.plugin.pushstream"));
        assert!(!auth.check_plugin("tok", "janus.plugin.pushstream"));
    }

    #[test]
    fn stored_unrestricted_token_allows_any_plugin() {
        let auth = TokenAuth::stored();
        auth.add_token("tok");
        assert!(auth.check_plugin("tok", "janus.plugin.pushstream"));
        assert!(auth.list_plugins("tok").is_empty());
    }

    #[test]
    fn removed_token_loses_plugin_access() {
        let auth = TokenAuth::stored();
        auth.add_token("tok");
        auth.allow_plugin("tok", "janus.plugin.pushstream");
        auth.remove_token("tok");
        assert!(!auth.check_token("tok"));
        assert!(!auth.check_plugin("tok", "janus.plugin.pushstream"));
        assert!(auth.list_plugins("tok").is_empty());
        // ACL is gone even if the same token string comes back.
        auth.add_token("tok");
        assert!(auth.check_plugin("tok", "janus.plugin.anything"));
    }

    #[test]
    fn acl_calls_fail_in_signed_mode() {
        let auth = TokenAuth::signed("k");
        assert!(!auth.add_token("tok"));
        assert!(!auth.remove_token("tok"));
        assert!(!auth.allow_plugin("tok", "p"));
        assert!(auth.list_tokens().is_empty());
    }

    #[test]
    fn signed_token_round_trip() {
        let auth = TokenAuth::signed("k");
        let token = sign("k", "9999999999,janus,janus.plugin.pushstream");
        assert!(auth.check_token_at(&token, 1_000_000));
        assert!(auth.check_plugin_at(&token, "janus.plugin.pushstream", 1_000_000));
        assert!(!auth.check_plugin_at(&token, "janus.plugin.other", 1_000_000));
    }

    #[test]
    fn signed_token_without_descriptor_fails_plugin_check() {
        let auth = TokenAuth::signed("k");
        let token = sign("k", "9999999999,janus");
        assert!(auth.check_token_at(&token, 1_000_000));
        assert!(!auth.check_plugin_at(&token, "janus.plugin.pushstream", 1_000_000));
    }

    #[test]
    fn signed_token_expiry_is_strict() {
        let auth = TokenAuth::signed("k");
        let token = sign("k", "1000,janus");
        assert!(auth.check_token_at(&token, 999));
        // Expiry second itself is already too late.
        assert!(!auth.check_token_at(&token, 1000));
        assert!(!auth.check_token_at(&token, 1001));
    }

    #[test]
    fn signed_token_realm_and_signature_must_match() {
        let auth = TokenAuth::signed("k");
        let wrong_realm = sign("k", "9999999999,other");
        assert!(!auth.check_token_at(&wrong_realm, 0));
        let wrong_secret = sign("not-k", "9999999999,janus");
        assert!(!auth.check_token_at(&wrong_secret, 0));
    }

    #[test]
    fn signed_token_shape_is_enforced() {
        let auth = TokenAuth::signed("k");
        assert!(!auth.check_token_at("no-separator", 0));
        assert!(!auth.check_token_at(":sig", 0));
        assert!(!auth.check_token_at("payload:", 0));
        assert!(!auth.check_token_at("1,janus:sig:extra", 0));
        assert!(!auth.check_token_at("notanumber,janus:sig", 0));
        assert!(!auth.check_token_at("9999999999:sig", 0));
    }

    #[test]
    fn hmac_signature_is_deterministic() {
        let a = sign("k", "9999999999,janus");
        let b = sign("k", "9999999999,janus");
        assert_eq!(a, b);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
