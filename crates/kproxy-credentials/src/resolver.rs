//! Reuse-or-issue decision for each selected cluster

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    retry_with_relogin, AuthorityConnector, CacheLookup, ClusterSelector, CredentialError,
    CredentialIssuer, CredentialRecord, CredentialSet, CredentialStore, MfaPrompt,
};

/// Wildcard organizational unit granting every sub-cluster
const ANY_SUB_CLUSTER: &str = "*";

/// Confirm that `record` is allowed to reach `sub_cluster`
///
/// Issued client certificates list their permitted sub-clusters as subject
/// organizational units.
pub fn check_cluster_access(
    record: &CredentialRecord,
    sub_cluster: &str,
) -> Result<(), CredentialError> {
    let info = record.certificate.info()?;
    let allowed = info
        .organizational_units
        .iter()
        .any(|unit| unit == sub_cluster || unit == ANY_SUB_CLUSTER);

    if allowed {
        Ok(())
    } else {
        Err(CredentialError::AccessDenied(format!(
            "issued certificate does not grant access to {} (allowed: {:?})",
            sub_cluster, info.organizational_units
        )))
    }
}

/// Builds the [`CredentialSet`] for a run
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    connector: Arc<dyn AuthorityConnector>,
    mfa: Arc<dyn MfaPrompt>,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn AuthorityConnector>,
        mfa: Arc<dyn MfaPrompt>,
    ) -> Self {
        Self {
            store,
            connector,
            mfa,
        }
    }

    /// Resolve a credential for every selector
    ///
    /// Selectors are processed in order and any failure aborts the whole call;
    /// no partial set is returned. The authority session is opened once up
    /// front and closed on every path.
    pub async fn resolve(
        &self,
        selectors: &[ClusterSelector],
    ) -> Result<CredentialSet, CredentialError> {
        let connector = self.connector.as_ref();
        let issuer = retry_with_relogin(connector, || connector.connect()).await?;

        let result = self.resolve_with(issuer.as_ref(), selectors).await;

        if let Err(e) = issuer.close().await {
            warn!("Failed to close authority session: {}", e);
        }
        result
    }

    async fn resolve_with(
        &self,
        issuer: &dyn CredentialIssuer,
        selectors: &[ClusterSelector],
    ) -> Result<CredentialSet, CredentialError> {
        let mut credentials = CredentialSet::new();

        for selector in selectors {
            let record = match self.lookup_cached(selector).await? {
                CacheLookup::Usable(record) => {
                    debug!("Client cert loaded from store for {}", selector);
                    record
                }
                CacheLookup::Unusable { reason } => {
                    debug!("Cached client cert for {} is unusable: {}", selector, reason);
                    self.issue(issuer, selector).await?
                }
                CacheLookup::NotFound => self.issue(issuer, selector).await?,
            };
            credentials.insert(selector.key(), record);
        }

        Ok(credentials)
    }

    /// Consult the store for `selector`
    pub async fn lookup_cached(
        &self,
        selector: &ClusterSelector,
    ) -> Result<CacheLookup, CredentialError> {
        match self.store.get(&selector.remote_cluster).await? {
            Some(credential) => Ok(credential.lookup(&selector.sub_cluster, Utc::now())),
            None => Ok(CacheLookup::NotFound),
        }
    }

    async fn issue(
        &self,
        issuer: &dyn CredentialIssuer,
        selector: &ClusterSelector,
    ) -> Result<CredentialRecord, CredentialError> {
        let issued = issuer.issue(selector, self.mfa.as_ref()).await?;

        let record = issued
            .credential
            .kube_record(&selector.sub_cluster)
            .map_err(|e| match e {
                CredentialError::NotFound(msg) => CredentialError::Issuance(msg),
                other => other,
            })?;
        check_cluster_access(&record, &selector.sub_cluster)?;

        if issued.mfa_required {
            debug!("Client cert issued with MFA for {}; not caching", selector);
        } else {
            self.store
                .put(&selector.remote_cluster, issued.credential)
                .await?;
            debug!("Client cert issued and cached for {}", selector);
        }

        Ok(record)
    }
}
