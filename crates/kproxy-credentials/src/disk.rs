//! On-disk key directory
//!
//! Layout under `<home>/keys/<proxy-host>/`:
//!
//! ```text
//! <user>                                  client private key
//! <user>-kube/<cluster>/<kube>-x509.pem   cached sub-cluster certificates
//! <user>-kube/<cluster>/localca.pem       local proxy CA
//! <user>-kube/localproxy-<port>           published kubeconfig
//! cas/<cluster>.pem                       remote cluster CA bundle
//! ```

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{Credential, CredentialError, CredentialStore};

const CERT_SUFFIX: &str = "-x509.pem";

/// Paths of one user's keys for one proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDir {
    root: PathBuf,
    username: String,
}

impl KeyDir {
    pub fn new(home: &Path, proxy_host: &str, username: &str) -> Self {
        Self {
            root: home.join("keys").join(proxy_host),
            username: username.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_path(&self) -> PathBuf {
        self.root.join(&self.username)
    }

    fn kube_root(&self) -> PathBuf {
        self.root.join(format!("{}-kube", self.username))
    }

    pub fn kube_dir(&self, remote_cluster: &str) -> PathBuf {
        self.kube_root().join(remote_cluster)
    }

    pub fn kube_cert_path(&self, remote_cluster: &str, sub_cluster: &str) -> PathBuf {
        self.kube_dir(remote_cluster)
            .join(format!("{}{}", sub_cluster, CERT_SUFFIX))
    }

    pub fn local_ca_path(&self, remote_cluster: &str) -> PathBuf {
        self.kube_dir(remote_cluster).join("localca.pem")
    }

    pub fn cas_path(&self, remote_cluster: &str) -> PathBuf {
        self.root.join("cas").join(format!("{}.pem", remote_cluster))
    }

    pub fn kubeconfig_path(&self, name: &str) -> PathBuf {
        self.kube_root().join(name)
    }

    /// Read the client key, generating and saving one on first use
    pub fn load_or_create_private_key(&self) -> Result<String, CredentialError> {
        let path = self.key_path();
        match std::fs::read_to_string(&path) {
            Ok(pem) => Ok(pem),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let pem = kproxy_cert::generate_private_key_pem()?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, &pem)?;
                restrict_permissions(&path)?;
                info!("Generated client key at {:?}", path);
                Ok(pem)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Reject names that would escape the key directory
fn validate_name(kind: &str, name: &str) -> Result<(), CredentialError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(CredentialError::Store(format!("invalid {} name: {:?}", kind, name)));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CredentialError::Store(format!(
            "{} name must contain only alphanumeric characters, dots, hyphens, and underscores: {:?}",
            kind, name
        )));
    }
    Ok(())
}

/// Credential store backed by a [`KeyDir`]
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    keys: KeyDir,
}

impl FileCredentialStore {
    pub fn new(keys: KeyDir) -> Self {
        Self { keys }
    }

    async fn read_kube_certs(
        &self,
        remote_cluster: &str,
        credential: &mut Credential,
    ) -> Result<(), CredentialError> {
        let dir = self.keys.kube_dir(remote_cluster);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(sub_cluster) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(CERT_SUFFIX))
            else {
                continue;
            };
            let cert_pem = tokio::fs::read_to_string(entry.path()).await?;
            credential
                .kube_certs
                .insert(sub_cluster.to_string(), cert_pem);
        }
        Ok(())
    }

    async fn clear_kube_certs(&self, remote_cluster: &str) -> Result<(), CredentialError> {
        let dir = self.keys.kube_dir(remote_cluster);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(CERT_SUFFIX) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, remote_cluster: &str) -> Result<Option<Credential>, CredentialError> {
        validate_name("cluster", remote_cluster)?;

        let private_key_pem = match tokio::fs::read_to_string(self.keys.key_path()).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut credential = Credential::new(remote_cluster, private_key_pem);
        self.read_kube_certs(remote_cluster, &mut credential).await?;
        debug!(
            "Loaded {} cached certificate(s) for {}",
            credential.kube_certs.len(),
            remote_cluster
        );
        Ok(Some(credential))
    }

    async fn put(
        &self,
        remote_cluster: &str,
        credential: Credential,
    ) -> Result<(), CredentialError> {
        validate_name("cluster", remote_cluster)?;
        for sub_cluster in credential.kube_certs.keys() {
            validate_name("kube cluster", sub_cluster)?;
        }

        let key_path = self.keys.key_path();
        let existing_key = match tokio::fs::read_to_string(&key_path).await {
            Ok(pem) => Some(pem),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if existing_key.as_deref() != Some(credential.private_key_pem.as_str()) {
            if existing_key.is_some() {
                debug!("Client key changed; dropping cached certificates for {}", remote_cluster);
                self.clear_kube_certs(remote_cluster).await?;
            }
            if let Some(parent) = key_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&key_path, &credential.private_key_pem).await?;
            restrict_permissions(&key_path)?;
        }

        tokio::fs::create_dir_all(self.keys.kube_dir(remote_cluster)).await?;
        for (sub_cluster, cert_pem) in &credential.kube_certs {
            let path = self.keys.kube_cert_path(remote_cluster, sub_cluster);
            tokio::fs::write(&path, cert_pem).await?;
            restrict_permissions(&path)?;
        }
        Ok(())
    }
}
