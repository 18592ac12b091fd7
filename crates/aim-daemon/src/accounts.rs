//! Multi-account registry.
//!
//! Every account is one encrypted state envelope in the state directory;
//! the file stem is the account name. Switching flushes the active account,
//! retargets the persister at the target envelope, and loads it into the
//! live kernel, session manager and store. The active account always
//! appears in listings even before its first flush.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::Identity;
use aim_identity::IdentityKernel;

use crate::persist::EnvelopePersister;

/// File extension of account state envelopes.
const ACCOUNT_EXT: &str = "aim";

/// One row of `account.list`.
#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub name: String,
    pub active: bool,
}

/// The `account.current` view: name plus the loaded identity, if any.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentAccount {
    pub name: String,
    pub identity: Option<Identity>,
}

/// Registry over the per-account envelopes in the state directory.
pub struct Accounts {
    state_dir: PathBuf,
    persister: Arc<EnvelopePersister>,
    kernel: Arc<IdentityKernel>,
}

impl Accounts {
    pub fn new(
        state_dir: PathBuf,
        persister: Arc<EnvelopePersister>,
        kernel: Arc<IdentityKernel>,
    ) -> Self {
        Self { state_dir, persister, kernel }
    }

    fn active_name(&self) -> String {
        self.persister
            .current_path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("default")
            .to_owned()
    }

    /// Account names on disk, plus the active one.
    pub fn list(&self) -> Vec<AccountInfo> {
        let active = self.active_name();
        let mut names = vec![active.clone()];
        if let Ok(entries) = std::fs::read_dir(&self.state_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ACCOUNT_EXT) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_owned());
                }
            }
        }
        names.sort();
        names.dedup();
        names
            .into_iter()
            .map(|name| AccountInfo { active: name == active, name })
            .collect()
    }

    pub fn current(&self) -> CurrentAccount {
        CurrentAccount { name: self.active_name(), identity: self.kernel.identity() }
    }

    /// Switch the daemon to another account's envelope.
    ///
    /// The active account is flushed first, so switching back later resumes
    /// exactly where it left off.
    pub fn switch(&self, name: &str) -> CoreResult<CurrentAccount> {
        let name = name.trim();
        if name.is_empty()
            || !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::api("malformed account name"));
        }
        if name == self.active_name() {
            return Ok(self.current());
        }

        let target = self.state_dir.join(format!("{name}.{ACCOUNT_EXT}"));
        if !target.exists() {
            return Err(CoreError::not_found("account"));
        }

        self.persister.flush_now()?;
        self.persister.retarget(target);
        self.persister.load()?;
        tracing::info!(account = name, "switched account");
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_session::SessionManager;
    use aim_store::Store;

    fn persister_for(
        state_dir: &PathBuf,
        account: &str,
        display_name: &str,
    ) -> (Arc<IdentityKernel>, Arc<EnvelopePersister>) {
        let kernel = Arc::new(IdentityKernel::new());
        kernel.create_identity(display_name, "pw", "laptop").unwrap();
        let secret = kernel.snapshot().signing_secret.unwrap();
        let sessions = Arc::new(SessionManager::from_identity_secret(&secret));
        let persister = EnvelopePersister::new(
            kernel.clone(),
            sessions,
            Arc::new(Store::new()),
            state_dir.join(format!("{account}.aim")),
            "passphrase".into(),
        );
        (kernel, persister)
    }

    #[test]
    fn list_includes_active_and_on_disk_accounts() {
        let state_dir = std::env::temp_dir().join(format!("aim-acct-{}", uuid::Uuid::new_v4()));
        let (kernel, primary) = persister_for(&state_dir, "primary", "Alice");
        let (_, work) = persister_for(&state_dir, "work", "Worker");
        work.flush_now().unwrap();

        let accounts = Accounts::new(state_dir.clone(), primary, kernel);
        let listed = accounts.list();
        let names: Vec<&str> = listed.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "work"]);
        assert!(listed[0].active);
        assert!(!listed[1].active);

        std::fs::remove_dir_all(&state_dir).ok();
    }

    #[test]
    fn switch_loads_the_target_and_flushes_the_source() {
        let state_dir = std::env::temp_dir().join(format!("aim-acct-{}", uuid::Uuid::new_v4()));
        let (kernel, primary) = persister_for(&state_dir, "primary", "Alice");
        let primary_id = kernel.identity().unwrap().id;

        let (work_kernel, work) = persister_for(&state_dir, "work", "Worker");
        let work_id = work_kernel.identity().unwrap().id;
        work.flush_now().unwrap();

        let accounts = Accounts::new(state_dir.clone(), primary, kernel.clone());
        let current = accounts.switch("work").unwrap();
        assert_eq!(current.name, "work");
        assert_eq!(current.identity.unwrap().id, work_id);
        assert_eq!(kernel.identity().unwrap().id, work_id);
        // The source account was flushed on the way out and survives a
        // round trip.
        let back = accounts.switch("primary").unwrap();
        assert_eq!(back.identity.unwrap().id, primary_id);

        std::fs::remove_dir_all(&state_dir).ok();
    }

    #[test]
    fn unknown_and_malformed_accounts_are_rejected() {
        let state_dir = std::env::temp_dir().join(format!("aim-acct-{}", uuid::Uuid::new_v4()));
        let (kernel, primary) = persister_for(&state_dir, "primary", "Alice");
        let accounts = Accounts::new(state_dir.clone(), primary, kernel);

        assert_eq!(accounts.switch("missing").unwrap_err().to_string(), "account not found");
        assert!(accounts.switch("../escape").is_err());
        assert!(accounts.switch("").is_err());

        std::fs::remove_dir_all(&state_dir).ok();
    }
}
