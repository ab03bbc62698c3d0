//! User profile management
//!
//! Stores the proxy address, user and session tokens in <home>/profile.json

use anyhow::{Context, Result};
use kproxy_credentials::SessionTokens;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const PROFILE_FILE: &str = "profile.json";

/// Persisted login state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Authority / proxy address (host:port)
    pub proxy_addr: Option<String>,
    /// Kube cluster address; defaults to the proxy address
    pub kube_cluster_addr: Option<String>,
    pub username: Option<String>,
    /// Root cluster name, used when no remote cluster is given
    pub site_name: Option<String>,
    pub session_token: Option<String>,
    pub renew_token: Option<String>,
}

impl Profile {
    /// Host part of the proxy address
    pub fn proxy_host(&self) -> Option<&str> {
        let addr = self.proxy_addr.as_deref()?;
        let addr = addr.trim_start_matches("https://");
        match addr.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => Some(host),
            _ => Some(addr),
        }
    }

    pub fn kube_cluster_addr(&self) -> Option<&str> {
        self.kube_cluster_addr
            .as_deref()
            .or(self.proxy_addr.as_deref())
    }

    pub fn session_tokens(&self) -> Option<SessionTokens> {
        self.session_token.as_ref().map(|session_token| SessionTokens {
            session_token: session_token.clone(),
            renew_token: self.renew_token.clone(),
        })
    }

    pub fn set_session_tokens(&mut self, tokens: SessionTokens) {
        self.session_token = Some(tokens.session_token);
        self.renew_token = tokens.renew_token;
    }
}

/// Profile manager rooted at the kproxy home directory
pub struct ProfileManager {
    home: PathBuf,
}

impl ProfileManager {
    /// Use `home`, or ~/.kproxy when not given
    pub fn new(home: Option<PathBuf>) -> Result<Self> {
        let home = match home {
            Some(home) => home,
            None => dirs::home_dir()
                .context("Failed to get home directory")?
                .join(".kproxy"),
        };
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn profile_path(&self) -> PathBuf {
        self.home.join(PROFILE_FILE)
    }

    /// Load the profile from disk
    pub fn load(&self) -> Result<Profile> {
        let path = self.profile_path();

        // Return default profile if file doesn't exist
        if !path.exists() {
            return Ok(Profile::default());
        }

        let json =
            fs::read_to_string(&path).context(format!("Failed to read profile: {:?}", path))?;

        let profile: Profile =
            serde_json::from_str(&json).context(format!("Failed to parse profile: {:?}", path))?;

        Ok(profile)
    }

    /// Save the profile to disk
    pub fn save(&self, profile: &Profile) -> Result<()> {
        let path = self.profile_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create profile directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(profile).context("Failed to serialize profile")?;

        fs::write(&path, json).context(format!("Failed to write profile: {:?}", path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_profile_is_default() {
        let temp = TempDir::new().unwrap();
        let manager = ProfileManager::new(Some(temp.path().to_path_buf())).unwrap();
        assert_eq!(manager.load().unwrap(), Profile::default());
    }

    #[test]
    fn test_profile_save_and_load() {
        let temp = TempDir::new().unwrap();
        let manager = ProfileManager::new(Some(temp.path().join("nested"))).unwrap();

        let mut profile = Profile {
            proxy_addr: Some("proxy.example.com:3080".to_string()),
            username: Some("alice".to_string()),
            ..Default::default()
        };
        profile.set_session_tokens(SessionTokens {
            session_token: "session".to_string(),
            renew_token: Some("renew".to_string()),
        });
        manager.save(&profile).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded, profile);
        assert_eq!(
            loaded.session_tokens().unwrap().renew_token.as_deref(),
            Some("renew")
        );
    }

    #[test]
    fn test_proxy_host() {
        let profile = Profile {
            proxy_addr: Some("proxy.example.com:3080".to_string()),
            ..Default::default()
        };
        assert_eq!(profile.proxy_host(), Some("proxy.example.com"));
        assert_eq!(profile.kube_cluster_addr(), Some("proxy.example.com:3080"));

        let profile = Profile {
            proxy_addr: Some("https://proxy.example.com".to_string()),
            kube_cluster_addr: Some("kube.example.com:3026".to_string()),
            ..Default::default()
        };
        assert_eq!(profile.proxy_host(), Some("proxy.example.com"));
        assert_eq!(profile.kube_cluster_addr(), Some("kube.example.com:3026"));
    }
}
