use std::fmt;

use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Key under which a cloudlet's platform credentials are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialKey {
    pub region: String,
    pub org: String,
    pub physical_name: String,
}

impl CredentialKey {
    pub fn new(region: &str, org: &str, physical_name: &str) -> Self {
        Self {
            region: region.to_string(),
            org: org.to_string(),
            physical_name: physical_name.to_string(),
        }
    }

    /// Secret store path holding the credential document.
    pub fn vault_path(&self) -> String {
        format!(
            "/secret/data/{}/cloudlet/vcd/{}/{}/vcd.json",
            self.region, self.org, self.physical_name
        )
    }
}

/// Connection credentials for the platform API.
#[derive(Clone)]
pub struct Credentials {
    pub endpoint: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub org: String,
    pub vdc: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("org", &self.org)
            .field("vdc", &self.vdc)
            .finish()
    }
}

/// Source of platform credentials, keyed by region/org/physical name.
pub trait CredentialProvider: Send + Sync {
    fn get_credentials(&self, key: &CredentialKey) -> Result<Credentials>;
}

/// Reads credentials from `VCD_URL`, `VCD_USER`, `VCD_PASSWORD`, `VCD_ORG`, `VCD_VDC`.
/// Suitable for dev environments; the key is only used in error messages.
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn get_credentials(&self, key: &CredentialKey) -> Result<Credentials> {
        let var = |name: &str| {
            std::env::var(name).with_context(|| {
                format!(
                    "Missing {} for cloudlet credentials at {}",
                    name,
                    key.vault_path()
                )
            })
        };
        Ok(Credentials {
            endpoint: var("VCD_URL")?,
            username: var("VCD_USER")?,
            password: Zeroizing::new(var("VCD_PASSWORD")?),
            org: var("VCD_ORG")?,
            vdc: var("VCD_VDC")?,
        })
    }
}

/// Hands out one fixed credential set regardless of key.
pub struct StaticCredentialProvider {
    creds: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(creds: Credentials) -> Self {
        Self { creds }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_credentials(&self, _key: &CredentialKey) -> Result<Credentials> {
        Ok(self.creds.clone())
    }
}
