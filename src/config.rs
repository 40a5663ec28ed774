use anyhow::{bail, Context, Result};
use globset::Glob;
use rand_core::{OsRng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A single user namespace entry from the registration file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Namespace {
    pub regex: String,
    pub exclusive: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Namespaces {
    #[serde(default)]
    pub users: Vec<Namespace>,
    #[serde(default)]
    pub aliases: Vec<Namespace>,
    #[serde(default)]
    pub rooms: Vec<Namespace>,
}

/// Appservice registration file, read once at startup (6).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Registration {
    pub id: String,
    pub url: String,
    pub as_token: String,
    pub hs_token: String,
    #[serde(default)]
    pub rate_limited: bool,
    pub sender_localpart: String,
    pub namespaces: Namespaces,
}

lazy_static::lazy_static! {
    static ref PUPPET_NAMESPACE_RE: Regex = Regex::new(r"^@([^.]+)\.\*$").unwrap();
}

impl Registration {
    pub fn load(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading registration file {path}"))?;
        let reg: Registration =
            serde_yaml::from_str(&text).with_context(|| format!("parsing registration file {path}"))?;
        reg.puppet_prefix()?;
        Ok(reg)
    }

    /// Validates the user namespace regex and extracts the puppet localpart
    /// prefix from it. Non-conforming registrations abort startup (6).
    pub fn puppet_prefix(&self) -> Result<String> {
        let entry = self
            .namespaces
            .users
            .first()
            .context("registration has no user namespace")?;
        let caps = PUPPET_NAMESPACE_RE
            .captures(&entry.regex)
            .with_context(|| format!("user namespace regex '{}' must match ^@([^.]+)\\.*$", entry.regex))?;
        Ok(caps[1].to_string())
    }

    pub fn generate(id: &str, url: &str, puppet_prefix: &str, sender_localpart: &str) -> Self {
        Registration {
            id: id.to_string(),
            url: url.to_string(),
            as_token: random_token(),
            hs_token: random_token(),
            rate_limited: false,
            sender_localpart: sender_localpart.to_string(),
            namespaces: Namespaces {
                users: vec![Namespace {
                    regex: format!("@{puppet_prefix}.*"),
                    exclusive: true,
                }],
                aliases: vec![],
                rooms: vec![],
            },
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let text = serde_yaml::to_string(self)?;
        fs::write(path, text).with_context(|| format!("writing registration file {path}"))
    }
}

fn random_token() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut bytes = [0u8; 64];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| CHARS[(*b as usize) % CHARS.len()] as char)
        .collect()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaskLevel {
    User,
    Admin,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberSync {
    Lazy,
    Half,
    #[default]
    Full,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NetworkConfig {
    pub servers: Vec<ServerConfig>,
}

/// Bridge-wide persisted config (3), stored as user account data under `"irc"`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BridgeConfig {
    pub owner: Option<String>,
    #[serde(default)]
    pub allow: HashMap<String, MaskLevel>,
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,
    #[serde(default)]
    pub idents: HashMap<String, String>,
    #[serde(default)]
    pub member_sync: MemberSync,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default = "default_use_hidden_room")]
    pub use_hidden_room: bool,
}

fn default_use_hidden_room() -> bool {
    true
}

impl BridgeConfig {
    /// Checks a mxid against the allow-list mask glob patterns (6, `ADDMASK`).
    /// Owner is always treated as admin regardless of the allow-list.
    pub fn access_for(&self, mxid: &str) -> Option<MaskLevel> {
        if self.owner.as_deref() == Some(mxid) {
            return Some(MaskLevel::Admin);
        }
        for (mask, level) in &self.allow {
            if let Ok(glob) = Glob::new(mask) {
                if glob.compile_matcher().is_match(mxid) {
                    return Some(level.clone());
                }
            }
        }
        None
    }

    pub fn is_user(&self, mxid: &str) -> bool {
        self.access_for(mxid).is_some()
    }

    pub fn is_admin(&self, mxid: &str) -> bool {
        self.access_for(mxid) == Some(MaskLevel::Admin)
    }
}

pub fn ensure_registration_path(path: &str) -> Result<()> {
    if !Path::new(path).exists() {
        bail!("registration file {path} does not exist; run with --generate first");
    }
    Ok(())
}
