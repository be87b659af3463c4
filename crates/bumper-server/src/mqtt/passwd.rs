//! Password file for MQTT clients that are neither devices nor apps.
//!
//! One `user:hash` per line, `#` starts a comment. Hashes are SHA-crypt
//! (`$5$` or `$6$`).

use bumper_core::BumperResult;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome of a password-file check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAuth {
    Accepted,
    NoEntry,
    Mismatch,
}

#[derive(Debug, Default)]
pub struct PasswordFile {
    users: HashMap<String, String>,
}

impl PasswordFile {
    /// Read `path`; a missing file yields an empty table.
    pub fn load(path: &Path) -> BumperResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let file = Self::parse(&text);
                debug!(path = %path.display(), users = file.len(), "password file loaded");
                Ok(file)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no password file");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut users = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((user, hash)) if !user.is_empty() => {
                    users.insert(user.to_string(), hash.to_string());
                }
                _ => warn!(line = lineno + 1, "malformed password file line"),
            }
        }
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn verify(&self, username: &str, password: &str) -> FileAuth {
        let Some(hash) = self.users.get(username) else {
            return FileAuth::NoEntry;
        };
        let ok = if hash.starts_with("$6$") {
            sha_crypt::sha512_check(password, hash).is_ok()
        } else if hash.starts_with("$5$") {
            sha_crypt::sha256_check(password, hash).is_ok()
        } else {
            warn!(username, "unsupported hash scheme");
            false
        };
        if ok {
            FileAuth::Accepted
        } else {
            FileAuth::Mismatch
        }
    }
}
