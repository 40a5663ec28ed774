//! Puppet registry (4.D): deterministic nick -> mxid mapping, lazy appservice
//! user registration, and displayname reconciliation.

use crate::error::MatrixError;
use crate::matrix::MatrixApi;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Characters that may appear unescaped in a puppet localpart, per the
/// Matrix user id grammar.
fn is_safe(c: char) -> bool {
    matches!(c, '0'..='9' | 'a'..='z' | '-' | '.' | '=' | '_' | '/')
}

/// Escapes `nick` the way the puppet namespace regex requires: every byte of
/// the lowercased UTF-8 encoding that isn't in the safe set becomes
/// `=` followed by its two lowercase hex digits. `=` itself is always
/// escaped so the mapping stays injective.
pub fn escape_nick(nick: &str) -> String {
    let lower = nick.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    for c in lower.chars() {
        if is_safe(c) && c != '=' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                out.push('=');
                out.push_str(&format!("{byte:02x}"));
            }
        }
    }
    out
}

/// Builds the puppet localpart for `nick` on `network`, given the
/// registration's puppet prefix (testable scenario 5: prefix "irc", network
/// "libera", nick "a.b" -> "irc_libera_a.b").
pub fn puppet_localpart(prefix: &str, network: &str, nick: &str) -> String {
    format!("{prefix}_{}_{}", escape_nick(network), escape_nick(nick))
}

pub fn puppet_mxid(prefix: &str, network: &str, nick: &str, server_name: &str) -> String {
    format!("@{}:{server_name}", puppet_localpart(prefix, network, nick))
}

/// Tracks which puppets have been registered and what displayname we last
/// set for them, so repeated nick changes don't re-issue redundant profile
/// updates.
pub struct PuppetRegistry {
    matrix: Arc<dyn MatrixApi>,
    prefix: String,
    server_name: String,
    /// Mxids confirmed to exist already, so a puppet seen again doesn't
    /// re-issue a registration call it already knows will be redundant
    /// (4.D step 2: "If not cached, attempt appservice user registration").
    known: Mutex<HashSet<String>>,
    displaynames: Mutex<HashMap<String, Option<String>>>,
}

impl PuppetRegistry {
    pub fn new(matrix: Arc<dyn MatrixApi>, prefix: String, server_name: String) -> Self {
        PuppetRegistry {
            matrix,
            prefix,
            server_name,
            known: Mutex::new(HashSet::new()),
            displaynames: Mutex::new(HashMap::new()),
        }
    }

    pub fn mxid(&self, network: &str, nick: &str) -> String {
        puppet_mxid(&self.prefix, network, nick, &self.server_name)
    }

    /// Ensures the puppet for `network`/`nick` is registered, returning its
    /// mxid. `M_USER_IN_USE` from a prior run is treated as success (4.D):
    /// registration only needs to happen once, ever, per puppet. Once a
    /// mxid is known to exist, later calls skip the registration request
    /// entirely rather than re-issuing and re-swallowing "in use" each time.
    pub async fn ensure_puppet(&self, network: &str, nick: &str) -> Result<String, MatrixError> {
        let localpart = puppet_localpart(&self.prefix, network, nick);
        let mxid = format!("@{localpart}:{}", self.server_name);

        if !self.known.lock().unwrap().contains(&mxid) {
            match self.matrix.register_user(&localpart).await {
                Ok(_) | Err(MatrixError::UserInUse) => {
                    self.known.lock().unwrap().insert(mxid.clone());
                }
                Err(e) => return Err(e),
            }
        }

        self.reconcile_displayname(&mxid, nick).await;
        Ok(mxid)
    }

    /// Sets the puppet's displayname to `nick` if it isn't already that,
    /// logging rather than failing: a stale displayname is cosmetic, not a
    /// reason to drop the message that triggered this puppet's use.
    async fn reconcile_displayname(&self, mxid: &str, nick: &str) {
        {
            let cache = self.displaynames.lock().unwrap();
            if cache.get(mxid).map(|v| v.as_deref()) == Some(Some(nick)) {
                return;
            }
        }
        match self.matrix.set_displayname(mxid, nick).await {
            Ok(()) => {
                self.displaynames.lock().unwrap().insert(mxid.to_string(), Some(nick.to_string()));
            }
            Err(e) => warn!("failed to set displayname for {mxid} to {nick}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::test_support::RecordingMatrixApi;

    #[test]
    fn scenario_5_matches_the_documented_example() {
        assert_eq!(
            puppet_mxid("irc", "libera", "A.b~c!", "hs"),
            "@irc_libera_a.b=7ec=21:hs"
        );
    }

    #[test]
    fn escaping_is_deterministic() {
        assert_eq!(escape_nick("Foo_Bar"), escape_nick("foo_bar"));
    }

    #[test]
    fn safe_characters_pass_through_unescaped() {
        assert_eq!(escape_nick("nick-name.1_2/3"), "nick-name.1_2/3");
    }

    #[test]
    fn escaped_byte_is_always_two_hex_digits() {
        let escaped = escape_nick("a b");
        assert_eq!(escaped, "a=20b");
    }

    #[tokio::test]
    async fn ensure_puppet_registers_once_and_reconciles_displayname() {
        let matrix = Arc::new(RecordingMatrixApi::new());
        let registry = PuppetRegistry::new(matrix.clone(), "irc".to_string(), "hs".to_string());

        let mxid = registry.ensure_puppet("libera", "alice").await.unwrap();
        assert_eq!(mxid, "@irc_libera_alice:hs");
        assert_eq!(matrix.registered_localparts(), vec!["irc_libera_alice".to_string()]);

        // second call with the same nick should be served from the known-puppets
        // cache and not re-issue a registration (or a redundant displayname set)
        registry.ensure_puppet("libera", "alice").await.unwrap();
        assert_eq!(matrix.registered_localparts().len(), 1);
    }

    #[tokio::test]
    async fn ensure_puppet_registers_distinct_nicks_separately() {
        let matrix = Arc::new(RecordingMatrixApi::new());
        let registry = PuppetRegistry::new(matrix.clone(), "irc".to_string(), "hs".to_string());

        registry.ensure_puppet("libera", "alice").await.unwrap();
        registry.ensure_puppet("libera", "bob").await.unwrap();
        assert_eq!(matrix.registered_localparts().len(), 2);
    }
}
