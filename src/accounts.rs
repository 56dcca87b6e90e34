// ===============================
// src/accounts.rs (allow-lists + follower -> originating mapping)
// ===============================
use ahash::AHashMap as HashMap;

use crate::error::RelayError;

/// Static authorization table loaded from config.
///
/// An empty allow-list permits every account (older deployments ran without
/// one). The mapping is independent: a follower absent from it may never
/// dequeue, whatever the allow-lists say.
#[derive(Debug, Clone, Default)]
pub struct AccountTable {
    originating: Vec<String>,
    following: Vec<String>,
    mapping: HashMap<String, Vec<String>>,
}

impl AccountTable {
    pub fn new(
        originating: Vec<String>,
        following: Vec<String>,
        mapping: HashMap<String, Vec<String>>,
    ) -> Self {
        Self { originating, following, mapping }
    }

    pub fn authorize_originating(&self, account: &str) -> Result<(), RelayError> {
        check(&self.originating, account)
    }

    pub fn authorize_following(&self, account: &str) -> Result<(), RelayError> {
        check(&self.following, account)
    }

    /// Originating accounts a follower drains, highest priority first.
    pub fn sources_for(&self, follower: &str) -> Result<&[String], RelayError> {
        self.mapping
            .get(follower)
            .filter(|v| !v.is_empty())
            .map(|v| v.as_slice())
            .ok_or_else(|| RelayError::NoMapping { account: follower.to_string() })
    }

    pub fn originating(&self) -> &[String] {
        &self.originating
    }

    pub fn mapping_len(&self) -> usize {
        self.mapping.len()
    }
}

fn check(allowed: &[String], account: &str) -> Result<(), RelayError> {
    if allowed.is_empty() || allowed.iter().any(|a| a == account) {
        Ok(())
    } else {
        Err(RelayError::Unauthorized { account: account.to_string(), allowed: allowed.to_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AccountTable {
        let mut mapping = HashMap::new();
        mapping.insert("6098214".to_string(), vec!["7412666".to_string(), "7412667".to_string()]);
        mapping.insert("empty".to_string(), vec![]);
        AccountTable::new(vec!["7412666".into()], vec![], mapping)
    }

    #[test]
    fn empty_allow_list_permits_everyone() {
        let t = table();
        assert!(t.authorize_following("anyone").is_ok());
        assert!(t.authorize_originating("7412666").is_ok());
        match t.authorize_originating("1") {
            Err(RelayError::Unauthorized { account, allowed }) => {
                assert_eq!(account, "1");
                assert_eq!(allowed, vec!["7412666".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mapping_is_ordered_and_required() {
        let t = table();
        assert_eq!(t.sources_for("6098214").unwrap(), ["7412666", "7412667"]);
        assert!(matches!(t.sources_for("nope"), Err(RelayError::NoMapping { .. })));
        assert!(matches!(t.sources_for("empty"), Err(RelayError::NoMapping { .. })));
    }
}
