//! Image reference parsing.
//!
//! Follows `docker pull` conventions: `nginx` means `docker.io/library/nginx:latest`,
//! a first component containing `.` or `:` (or equal to `localhost`) names a registry.

use std::fmt;
use std::str::FromStr;

use layerfold_core::error::{FoldError, Result};

use super::digest::Digest;

/// Registry used when the reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, with port if one was given (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/alpine")
    pub repository: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Pinned manifest digest, if any
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `org/app:1.2` → docker.io/org/app:1.2
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:…` → pinned by digest, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        let invalid = |message: &str| FoldError::InvalidReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("empty image reference"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (name_tag, digest) = match trimmed.rsplit_once('@') {
            Some((name_tag, raw_digest)) => {
                let digest = Digest::parse(raw_digest).map_err(|e| FoldError::InvalidReference {
                    reference: reference.to_string(),
                    message: e.to_string(),
                })?;
                (name_tag, Some(digest))
            }
            None => (trimmed, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(tag) = tag {
            if tag.is_empty() {
                return Err(invalid("empty tag"));
            }
        }

        let (registry, repository) = split_registry(name).ok_or_else(|| invalid("empty repository"))?;
        if repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path component"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Reference pinned to `digest`, keeping registry and repository.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    /// Canonical `registry/repository[:tag][@digest]` form.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

/// Split `name[:tag]`; a colon before the last `/` belongs to a registry port.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let colon = last_segment_start + colon;
            (&name_tag[..colon], Some(&name_tag[colon + 1..]))
        }
        None => (name_tag, None),
    }
}

fn split_registry(name: &str) -> Option<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return None;
            }
            return Some((first.to_string(), rest.to_string()));
        }
    }
    if name.is_empty() {
        return None;
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Some((DEFAULT_REGISTRY.to_string(), repository))
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_reference())
    }
}

impl FromStr for ImageReference {
    type Err = FoldError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("3.19".to_string()));

        for (raw, repository, tag) in [("redis:7", "library/redis", "7"), ("node:20", "library/node", "20")] {
            let r = ImageReference::parse(raw).unwrap();
            assert_eq!(r.registry, "docker.io");
            assert_eq!(r.repository, repository);
            assert_eq!(r.tag.as_deref(), Some(tag));
            assert_eq!(r.full_reference(), format!("docker.io/{}:{}", repository, tag));
        }
    }

    #[test]
    fn test_parse_user_repo() {
        let r = ImageReference::parse("myorg/tool:v2").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myorg/tool");
        assert_eq!(r.tag, Some("v2".to_string()));
    }

    #[test]
    fn test_parse_custom_registry_deep_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/sub/image");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("latest".to_string()));

        let r = ImageReference::parse("registry.local:5000/app:dev").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.tag, Some("dev".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some(Digest::parse(DIGEST).unwrap()));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app:v1@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert!(r.digest.is_some());
        assert_eq!(r.full_reference(), format!("ghcr.io/org/app:v1@{}", DIGEST));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for raw in [
            "",
            "   ",
            "alpine@sha256:short",
            "alpine@invalid",
            "ghcr.io/",
            "alpine:",
            "Alpine",
            "org//app",
        ] {
            assert!(
                matches!(ImageReference::parse(raw), Err(FoldError::InvalidReference { .. })),
                "expected InvalidReference for {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let r = ImageReference::parse("  alpine  ").unwrap();
        assert_eq!(r.repository, "library/alpine");
    }

    #[test]
    fn test_with_digest_drops_tag() {
        let r = ImageReference::parse("alpine:3.19").unwrap();
        let pinned = r.with_digest(Digest::parse(DIGEST).unwrap());
        assert_eq!(pinned.tag, None);
        assert_eq!(pinned.to_string(), format!("docker.io/library/alpine@{}", DIGEST));
    }

    #[test]
    fn test_display_roundtrip() {
        let r = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/alpine:3.19");
        assert_eq!(r.to_string().parse::<ImageReference>().unwrap(), r);
    }
}
