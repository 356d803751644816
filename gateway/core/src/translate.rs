//! Identity translation between the virtual and host clusters.
//!
//! The gateway never stores mappings. It asks a [`Translator`] whenever it
//! needs to address the host-side counterpart of a virtual object.

use std::fmt;

/// Host object names may not exceed a DNS label.
const MAX_NAME_LEN: usize = 63;

/// Length of the readable prefix kept when a host name must be shortened.
const HASHED_PREFIX_LEN: usize = 52;

const LABEL_PREFIX: &str = "vcluster.loft.sh/label";
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";
pub const MANAGED_BY_LABEL: &str = "vcluster.loft.sh/managed-by";
pub const OBJECT_NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";
pub const OBJECT_NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-namespace";

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

/// Maps virtual object identities to host coordinates.
///
/// Implementations are pure: the same input always yields the same output.
pub trait Translator: Send + Sync {
    fn host_namespace(&self, namespace: &str) -> String;

    fn to_host(&self, namespace: &str, name: &str) -> NamespacedName;

    /// The inverse of [`Translator::to_host`]. Returns `None` for host names
    /// that were not produced by this translator or that were shortened.
    fn to_virtual(&self, namespace: &str, name: &str) -> Option<NamespacedName>;

    fn host_label(&self, key: &str) -> String;

    /// Labels every host object synced for this installation carries.
    fn managed_by(&self) -> String;

    /// The single host namespace every virtual namespace is mapped to, if the
    /// installation targets one.
    fn target_namespace(&self) -> Option<&str>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty target namespace")]
    EmptyNamespace,

    #[error("empty installation name")]
    EmptySuffix,
}

/// Places every virtual namespace into one host namespace, disambiguating
/// names as `{name}-x-{namespace}-x-{suffix}`.
#[derive(Clone, Debug)]
pub struct SingleNamespace {
    target: String,
    suffix: String,
}

// === impl NamespacedName ===

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            return f.write_str(&self.name);
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl SingleNamespace ===

impl SingleNamespace {
    pub fn new(target: impl Into<String>, suffix: impl Into<String>) -> Result<Self, Error> {
        let target = target.into();
        let suffix = suffix.into();
        if target.is_empty() {
            return Err(Error::EmptyNamespace);
        }
        if suffix.is_empty() {
            return Err(Error::EmptySuffix);
        }
        Ok(Self { target, suffix })
    }

    fn separator_suffix(&self) -> String {
        format!("-x-{}", self.suffix)
    }
}

impl Translator for SingleNamespace {
    fn host_namespace(&self, _namespace: &str) -> String {
        self.target.clone()
    }

    fn to_host(&self, namespace: &str, name: &str) -> NamespacedName {
        let readable = format!("{name}-x-{namespace}{}", self.separator_suffix());
        // A namespace containing the separator would make the readable form ambiguous.
        let name = if readable.len() > MAX_NAME_LEN || namespace.contains("-x-") {
            let digest = crate::sha256_hex(readable.as_bytes());
            let prefix = readable
                .get(..HASHED_PREFIX_LEN)
                .unwrap_or(&readable)
                .trim_end_matches('-');
            format!("{prefix}-{}", &digest[..10])
        } else {
            readable
        };
        NamespacedName::new(self.target.clone(), name)
    }

    fn to_virtual(&self, namespace: &str, name: &str) -> Option<NamespacedName> {
        if namespace != self.target {
            return None;
        }
        let rest = name.strip_suffix(&self.separator_suffix())?;
        let (vname, vns) = rest.rsplit_once("-x-")?;
        if vname.is_empty() || vns.is_empty() {
            return None;
        }
        let candidate = NamespacedName::new(vns, vname);
        (self.to_host(vns, vname).name == name).then_some(candidate)
    }

    fn host_label(&self, key: &str) -> String {
        let digest = crate::sha256_hex(key.as_bytes());
        format!("{LABEL_PREFIX}-{}-{}", self.suffix, &digest[..10])
    }

    fn managed_by(&self) -> String {
        self.suffix.clone()
    }

    fn target_namespace(&self) -> Option<&str> {
        Some(&self.target)
    }
}
