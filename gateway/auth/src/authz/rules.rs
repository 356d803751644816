//! Allow-list rules selecting which requests are delegated to the host.

use std::fmt;
use vcluster_gateway_core::Attributes;

const WILDCARD: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rule {
    Resource {
        group: String,
        version: String,
        resource: String,
        subresource: String,
        verb: String,
    },
    Path {
        path: String,
        verb: String,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("invalid rule {rule:?}: {reason}")]
pub struct InvalidRule {
    rule: String,
    reason: &'static str,
}

// === impl Rule ===

impl Rule {
    /// Parses `<group>/<version>/<resource>[/<subresource>]:<verb>`. The core
    /// group is written as an empty segment, e.g. `/v1/nodes/proxy:get`.
    pub fn parse_resource(s: &str) -> Result<Self, InvalidRule> {
        let invalid = |reason| InvalidRule {
            rule: s.to_string(),
            reason,
        };
        let (target, verb) = s.rsplit_once(':').ok_or_else(|| invalid("missing verb"))?;
        let parts = target.split('/').collect::<Vec<_>>();
        let (group, version, resource, subresource) = match parts.as_slice() {
            [g, v, r] => (*g, *v, *r, ""),
            [g, v, r, s] => (*g, *v, *r, *s),
            _ => return Err(invalid("expected group/version/resource[/subresource]")),
        };
        if version.is_empty() || resource.is_empty() || verb.is_empty() {
            return Err(invalid("empty version, resource or verb"));
        }
        Ok(Self::Resource {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            subresource: subresource.to_string(),
            verb: verb.to_string(),
        })
    }

    /// Parses `<path>:<verb>`. A trailing `*` in the path matches any suffix.
    pub fn parse_path(s: &str) -> Result<Self, InvalidRule> {
        let invalid = |reason| InvalidRule {
            rule: s.to_string(),
            reason,
        };
        let (path, verb) = s.rsplit_once(':').ok_or_else(|| invalid("missing verb"))?;
        if !path.starts_with('/') && path != WILDCARD {
            return Err(invalid("path must be absolute"));
        }
        if verb.is_empty() {
            return Err(invalid("empty verb"));
        }
        Ok(Self::Path {
            path: path.to_string(),
            verb: verb.to_string(),
        })
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        match self {
            Self::Resource {
                group,
                version,
                resource,
                subresource,
                verb,
            } => {
                attrs.resource_request
                    && field(group, &attrs.api_group)
                    && field(version, &attrs.api_version)
                    && field(resource, &attrs.resource)
                    && field(subresource, &attrs.subresource)
                    && field(verb, &attrs.verb)
            }
            Self::Path { path, verb } => {
                !attrs.resource_request && field(verb, &attrs.verb) && {
                    match path.strip_suffix(WILDCARD) {
                        Some(prefix) => attrs.path.starts_with(prefix),
                        None => *path == attrs.path,
                    }
                }
            }
        }
    }
}

fn field(rule: &str, value: &str) -> bool {
    rule == WILDCARD || rule == value
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource {
                group,
                version,
                resource,
                subresource,
                verb,
            } => {
                write!(f, "{group}/{version}/{resource}")?;
                if !subresource.is_empty() {
                    write!(f, "/{subresource}")?;
                }
                write!(f, ":{verb}")
            }
            Self::Path { path, verb } => write!(f, "{path}:{verb}"),
        }
    }
}
