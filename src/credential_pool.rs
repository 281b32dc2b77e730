// src/credential_pool.rs
//
// Rotation over interchangeable geocoder API keys. State lives for one run only.

use log::{info, warn};
use std::fmt;

/// One API key. The key itself never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub label: String,
    secret: String,
}

impl Credential {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("secret", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
struct CredentialState {
    exhausted: bool,
    requests: u64,
    successes: u64,
    quota_hits: u64,
}

/// Per-credential counters for the run summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialUsage {
    pub label: String,
    pub requests: u64,
    pub successes: u64,
    pub quota_hits: u64,
    pub exhausted: bool,
}

#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    states: Vec<CredentialState>,
    current: usize,
    pool_exhausted: bool,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        let states = vec![CredentialState::default(); credentials.len()];
        let pool_exhausted = credentials.is_empty();
        Self {
            credentials,
            states,
            current: 0,
            pool_exhausted,
        }
    }

    /// Labels keys `key-1`, `key-2`, ... in configuration order.
    pub fn from_keys<I, T>(keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let credentials = keys
            .into_iter()
            .map(|k| Into::<String>::into(k))
            .filter(|k| !k.trim().is_empty())
            .enumerate()
            .map(|(i, k)| Credential::new(format!("key-{}", i + 1), k.trim()))
            .collect();
        Self::new(credentials)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// True once every credential has been marked exhausted since the last success.
    pub fn is_exhausted(&self) -> bool {
        self.pool_exhausted
    }

    /// The active credential, or `None` when the pool is exhausted or empty.
    pub fn current(&self) -> Option<&Credential> {
        if self.pool_exhausted {
            return None;
        }
        self.credentials.get(self.current)
    }

    pub fn record_request(&mut self, credential: &Credential) {
        if let Some(idx) = self.index_of(credential) {
            self.states[idx].requests += 1;
        }
    }

    /// A success starts a new exhaustion round: every credential becomes eligible
    /// again, so the pool only runs dry once all of them fail after this point.
    pub fn record_success(&mut self, credential: &Credential) {
        if let Some(idx) = self.index_of(credential) {
            self.states[idx].successes += 1;
            for state in &mut self.states {
                state.exhausted = false;
            }
            self.pool_exhausted = false;
        }
    }

    /// Flags a credential after a quota / rate-limit response.
    pub fn mark_exhausted(&mut self, credential: &Credential) {
        if let Some(idx) = self.index_of(credential) {
            let state = &mut self.states[idx];
            if !state.exhausted {
                warn!("🔑 Credential {} exhausted", credential.label);
            }
            state.exhausted = true;
            state.quota_hits += 1;
        }
        if self.states.iter().all(|s| s.exhausted) {
            self.pool_exhausted = true;
        }
    }

    /// Moves to the next non-exhausted credential, wrapping around.
    ///
    /// Returns false, and flags the pool, when every credential is exhausted.
    pub fn rotate(&mut self) -> bool {
        let n = self.credentials.len();
        if n == 0 {
            self.pool_exhausted = true;
            return false;
        }
        for step in 1..=n {
            let idx = (self.current + step) % n;
            if !self.states[idx].exhausted {
                if idx != self.current {
                    info!(
                        "🔑 Rotating credential {} -> {}",
                        self.credentials[self.current].label, self.credentials[idx].label
                    );
                }
                self.current = idx;
                return true;
            }
        }
        warn!("🔑 All {} credentials are exhausted", n);
        self.pool_exhausted = true;
        false
    }

    pub fn usage(&self) -> Vec<CredentialUsage> {
        self.credentials
            .iter()
            .zip(&self.states)
            .map(|(c, s)| CredentialUsage {
                label: c.label.clone(),
                requests: s.requests,
                successes: s.successes,
                quota_hits: s.quota_hits,
                exhausted: s.exhausted,
            })
            .collect()
    }

    fn index_of(&self, credential: &Credential) -> Option<usize> {
        self.credentials.iter().position(|c| c == credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> CredentialPool {
        CredentialPool::from_keys((1..=n).map(|i| format!("secret-{}", i)))
    }

    #[test]
    fn test_current_starts_at_first() {
        let p = pool(3);
        assert_eq!(p.current().unwrap().label, "key-1");
        assert_eq!(p.current().unwrap().secret(), "secret-1");
    }

    #[test]
    fn test_rotate_skips_exhausted_and_wraps() {
        let mut p = pool(3);
        let second = p.credentials[1].clone();
        p.mark_exhausted(&second);
        assert!(p.rotate());
        assert_eq!(p.current().unwrap().label, "key-3");
        assert!(p.rotate());
        assert_eq!(p.current().unwrap().label, "key-1");
    }

    #[test]
    fn test_exhaustion_sets_flag() {
        let mut p = pool(2);
        for _ in 0..2 {
            let c = p.current().unwrap().clone();
            p.mark_exhausted(&c);
            p.rotate();
        }
        assert!(p.is_exhausted());
        assert!(p.current().is_none());
        assert!(!p.rotate());
    }

    #[test]
    fn test_success_revives_pool() {
        let mut p = pool(1);
        let c = p.current().unwrap().clone();
        p.mark_exhausted(&c);
        assert!(p.is_exhausted());
        p.record_success(&c);
        assert!(!p.is_exhausted());
        assert_eq!(p.current().unwrap(), &c);
    }

    #[test]
    fn test_success_clears_earlier_marks() {
        let mut p = pool(2);
        let first = p.current().unwrap().clone();
        p.mark_exhausted(&first);
        assert!(p.rotate());
        let second = p.current().unwrap().clone();
        p.record_success(&second);

        // key-1 was marked before the success, so it is tried again
        p.mark_exhausted(&second);
        assert!(!p.is_exhausted());
        assert!(p.rotate());
        assert_eq!(p.current().unwrap(), &first);

        p.mark_exhausted(&first);
        assert!(p.is_exhausted());
        assert!(!p.rotate());

        let usage = p.usage();
        assert_eq!(usage[0].quota_hits, 2);
        assert_eq!(usage[1].quota_hits, 1);
        assert!(usage.iter().all(|u| u.exhausted));
    }

    #[test]
    fn test_empty_pool_is_exhausted() {
        let mut p = CredentialPool::from_keys(Vec::<String>::new());
        assert!(p.is_empty());
        assert!(p.is_exhausted());
        assert!(p.current().is_none());
        assert!(!p.rotate());
    }

    #[test]
    fn test_blank_keys_are_ignored() {
        let p = CredentialPool::from_keys(vec!["", "  ", "abc"]);
        assert_eq!(p.len(), 1);
        assert_eq!(p.current().unwrap().label, "key-1");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let c = Credential::new("key-1", "top-secret");
        let shown = format!("{:?}", c);
        assert!(!shown.contains("top-secret"));
        assert!(shown.contains("key-1"));
    }

    #[test]
    fn test_usage_counts() {
        let mut p = pool(2);
        let c = p.current().unwrap().clone();
        p.record_request(&c);
        p.record_request(&c);
        p.record_success(&c);
        let usage = p.usage();
        assert_eq!(usage[0].requests, 2);
        assert_eq!(usage[0].successes, 1);
        assert_eq!(usage[1].requests, 0);
    }
}
