use anyhow::{Result, bail};

/// Suffix appended to a cluster name to form its platform group name.
pub const GROUP_SUFFIX: &str = "-vapp";

/// Default prefix for cluster-scoped internal networks.
pub const DEFAULT_INTERNAL_NET_PREFIX: &str = "mex-k8s-subnet-";

/// Platform object names longer than this are truncated.
const MAX_NAME_LEN: usize = 255;

/// Validate a cloudlet, cluster, or org identifier:
/// ASCII alphanumeric + hyphens, 1-63 chars, no leading/trailing hyphen.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        bail!("{} ID must be 1-63 characters, got {}", kind, id.len());
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        bail!("{} ID must be alphanumeric + hyphens: {:?}", kind, id);
    }
    if id.starts_with('-') || id.ends_with('-') {
        bail!("{} ID must not start or end with a hyphen: {:?}", kind, id);
    }
    Ok(())
}

/// Strip characters the platform rejects in object names.
pub fn name_sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| !matches!(c, ' ' | '&' | ',' | '!'))
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphabetic()) {
        out.insert(0, 'a');
    }
    if out.len() > MAX_NAME_LEN {
        out.truncate(MAX_NAME_LEN - 1);
    }
    out
}

/// Like [`name_sanitize`], but also usable where dots are not allowed.
pub fn id_sanitize(name: &str) -> String {
    name_sanitize(name).replace('.', "-")
}

/// The cloudlet/cluster/org triple that owns an internal network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkOwner {
    pub cloudlet: String,
    pub cluster: String,
    pub org: String,
}

impl NetworkOwner {
    pub fn new(cloudlet: &str, cluster: &str, org: &str) -> Self {
        Self {
            cloudlet: cloudlet.to_string(),
            cluster: cluster.to_string(),
            org: org.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.cloudlet, "Cloudlet")?;
        validate_id(&self.cluster, "Cluster")?;
        validate_id(&self.org, "Org")?;
        Ok(())
    }
}

/// Build the internal network name: `<prefix><cloudlet>-<cluster>-<org>`.
///
/// A hyphen inside a component is written as `--` so that
/// [`parse_internal_network_name`] can recover the triple.
pub fn internal_network_name(prefix: &str, owner: &NetworkOwner) -> Result<String> {
    owner.validate()?;
    let parts: Vec<String> = [&owner.cloudlet, &owner.cluster, &owner.org]
        .iter()
        .map(|c| c.replace('-', "--"))
        .collect();
    Ok(format!("{}{}", prefix, parts.join("-")))
}

/// Recover the owner triple from an internal network name.
///
/// Returns `None` for names that were not produced by [`internal_network_name`]
/// with the same prefix.
pub fn parse_internal_network_name(prefix: &str, name: &str) -> Option<NetworkOwner> {
    let rest = name.strip_prefix(prefix)?;
    let mut parts = Vec::with_capacity(3);
    let mut current = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '-' {
            current.push(c);
        } else if chars.peek() == Some(&'-') {
            chars.next();
            current.push('-');
        } else {
            parts.push(std::mem::take(&mut current));
        }
    }
    parts.push(current);

    let [cloudlet, cluster, org]: [String; 3] = parts.try_into().ok()?;
    let owner = NetworkOwner {
        cloudlet,
        cluster,
        org,
    };
    owner.validate().ok()?;
    Some(owner)
}

/// Platform group name for a cluster, built from its sanitized id.
pub fn group_name(cluster: &str) -> String {
    format!("{}{}", id_sanitize(cluster), GROUP_SUFFIX)
}

/// Cluster name for a platform group name, if it follows the convention.
pub fn cluster_from_group_name(group: &str) -> Option<&str> {
    group.strip_suffix(GROUP_SUFFIX).filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: &str = DEFAULT_INTERNAL_NET_PREFIX;

    #[test]
    fn test_validate_id_valid() {
        assert!(validate_id("cld1", "Cloudlet").is_ok());
        assert!(validate_id("MobiledgeX", "Org").is_ok());
        assert!(validate_id("a", "Cluster").is_ok());
        assert!(validate_id(&"a".repeat(63), "Cluster").is_ok());
    }

    #[test]
    fn test_validate_id_invalid() {
        assert!(validate_id("", "Cluster").is_err());
        assert!(validate_id(&"a".repeat(64), "Cluster").is_err());
        assert!(validate_id("-lead", "Cluster").is_err());
        assert!(validate_id("trail-", "Cluster").is_err());
        assert!(validate_id("has space", "Cluster").is_err());
        assert!(validate_id("under_score", "Cluster").is_err());
    }

    #[test]
    fn test_name_sanitize() {
        assert_eq!(name_sanitize("my app, v1!"), "myappv1");
        assert_eq!(name_sanitize("a/b&c"), "a_bc");
        assert_eq!(name_sanitize("1abc"), "a1abc");
        assert_eq!(name_sanitize("x.y"), "x.y");
        let long = "b".repeat(300);
        assert_eq!(name_sanitize(&long).len(), 254);
    }

    #[test]
    fn test_id_sanitize_replaces_dots() {
        assert_eq!(id_sanitize("app.v1.0"), "app-v1-0");
    }

    #[test]
    fn test_internal_network_name_plain() {
        let owner = NetworkOwner::new("cld1", "clust1", "acme");
        assert_eq!(
            internal_network_name(P, &owner).unwrap(),
            "mex-k8s-subnet-cld1-clust1-acme"
        );
    }

    #[test]
    fn test_internal_network_name_roundtrip() {
        for owner in [
            NetworkOwner::new("cld1", "clust1", "acme"),
            NetworkOwner::new("edge-site-2", "web-cluster", "big-org"),
            NetworkOwner::new("a", "b", "c"),
            NetworkOwner::new("x--y", "z", "Org9"),
        ] {
            let name = internal_network_name(P, &owner).unwrap();
            assert_eq!(parse_internal_network_name(P, &name), Some(owner));
        }
    }

    #[test]
    fn test_internal_network_name_rejects_bad_component() {
        let owner = NetworkOwner::new("cld1", "-bad", "acme");
        assert!(internal_network_name(P, &owner).is_err());
    }

    #[test]
    fn test_parse_internal_network_name_foreign() {
        assert!(parse_internal_network_name(P, "ext-net").is_none());
        assert!(parse_internal_network_name(P, "mex-k8s-subnet-only-two").is_none());
        assert!(parse_internal_network_name(P, "mex-k8s-subnet-a-b-c-d").is_none());
        assert!(parse_internal_network_name(P, "mex-k8s-subnet-a---b-c").is_none());
    }

    #[test]
    fn test_group_name() {
        assert_eq!(group_name("clust1"), "clust1-vapp");
        assert_eq!(cluster_from_group_name("clust1-vapp"), Some("clust1"));
        assert_eq!(cluster_from_group_name("-vapp"), None);
        assert_eq!(cluster_from_group_name("clust1"), None);
    }

    #[test]
    fn test_group_name_sanitizes_cluster_id() {
        assert_eq!(group_name("web.v2"), "web-v2-vapp");
        assert_eq!(group_name("my app"), "myapp-vapp");
        assert_eq!(group_name("9lives"), "a9lives-vapp");
        assert_eq!(cluster_from_group_name(&group_name("web.v2")), Some("web-v2"));
    }
}
