//! User blacklist: receivers belonging to a blacklisted user are excluded
//! from multilateration (their timestamps still count for clock sync,
//! but not for position solves).

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    users: HashSet<String>,
}

impl Blacklist {
    pub fn empty() -> Blacklist {
        Blacklist {
            users: HashSet::new(),
        }
    }

    /// Load a blacklist file. Only the first line is significant — this
    /// matches the reference tool's historical one-entry format.
    /// A missing file is treated as an empty blacklist, not an error,
    /// since this is reloaded on SIGHUP and the file may not exist yet.
    pub fn load(path: &Path) -> Result<Blacklist> {
        let mut users = HashSet::new();
        match fs::read_to_string(path) {
            Ok(contents) => {
                if let Some(first_line) = contents.lines().next() {
                    let trimmed = first_line.trim();
                    if !trimmed.is_empty() {
                        users.insert(trimmed.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Blacklist { users })
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.contains(user)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
