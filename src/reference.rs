//! Container image reference parsing.
//!
//! Parses tokens like `ghcr.io/org/app:v1.2` or `nginx@sha256:...` into a
//! normalized [`ImageReference`]. Two tokens that name the same image (for
//! example `nginx` and `docker.io/library/nginx:latest`) parse to equal values.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Registry used when a reference names no host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a reference carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Hostnames that all resolve to Docker Hub.
const DOCKER_HUB_ALIASES: &[&str] = &["index.docker.io", "registry-1.docker.io"];

const MAX_TAG_LEN: usize = 128;

/// Why a token could not be parsed into an [`ImageReference`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty token")]
    Empty,

    #[error("invalid character {found:?} in {token:?}")]
    InvalidCharacter { token: String, found: char },

    #[error("malformed digest in {token:?}: {detail}")]
    MalformedDigest { token: String, detail: &'static str },
}

impl ParseError {
    /// Short machine-friendly reason, used in reports.
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::Empty => "empty token",
            ParseError::InvalidCharacter { .. } => "invalid character",
            ParseError::MalformedDigest { .. } => "malformed digest",
        }
    }
}

/// Parsed and normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    /// Registry hostname, lower-cased, optionally with a port (e.g. "docker.io", "localhost:5000")
    pub registry: String,
    /// Slash-separated repository path (e.g. "library/nginx")
    pub repository: String,
    /// Tag, defaulted to "latest" when the token has neither tag nor digest
    pub tag: Option<String>,
    /// Content digest (e.g. "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference token.
    ///
    /// Grammar: `[registryHost/]repositoryPath[:tag][@digest]`. The first path
    /// segment is a host when it contains a `.` or `:` or equals `localhost`.
    /// Tokens holding template placeholders (`{`) are rejected.
    pub fn parse(token: &str) -> Result<Self, ParseError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ParseError::Empty);
        }

        if let Some(found) = token
            .chars()
            .find(|c| *c == '{' || *c == '}' || c.is_whitespace())
        {
            return Err(invalid(token, found));
        }

        let (name_tag, digest) = match token.split_once('@') {
            Some((name_tag, digest)) => (name_tag, Some(parse_digest(token, digest)?)),
            None => (token, None),
        };

        // A tag colon can only appear after the last slash; earlier colons are ports.
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                let tag = &name_tag[split + 1..];
                validate_tag(token, tag)?;
                (&name_tag[..split], Some(tag.to_string()))
            }
            None => (name_tag, None),
        };

        let (registry, repository) = split_registry_repository(token, name)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The same image under a different registry host.
    pub fn with_registry(&self, registry: &str) -> Self {
        let registry = normalize_host(registry);
        let repository = if registry == DEFAULT_REGISTRY && !self.repository.contains('/') {
            format!("library/{}", self.repository)
        } else {
            self.repository.clone()
        };
        ImageReference {
            registry,
            repository,
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        }
    }

    /// Tag to use when a container CLI needs `name:tag` form.
    ///
    /// Digest-only references get a tag derived from the digest, since
    /// `docker tag` cannot target a digest.
    pub fn push_tag(&self) -> String {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => digest.replace(':', "-"),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// `registry/repository:tag` form suitable for `docker tag` and `docker push`.
    pub fn tagged_name(&self) -> String {
        format!("{}:{}", self.name(), self.push_tag())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ImageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Check that a string is usable as a target registry host.
pub fn validate_host(host: &str) -> Result<(), ParseError> {
    if host.is_empty() {
        return Err(ParseError::Empty);
    }
    match host.chars().find(|c| !is_host_char(*c)) {
        Some(found) => Err(invalid(host, found)),
        None => Ok(()),
    }
}

/// The name part of a token as written, without tag or digest.
///
/// `nginx:1.21` gives `nginx` and `localhost:5000/app@sha256:...` gives
/// `localhost:5000/app`. Kustomize matches image names in this form.
pub fn written_name(token: &str) -> &str {
    let token = token.trim();
    let name_tag = token.split_once('@').map_or(token, |(name_tag, _)| name_tag);
    let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_tag[last_slash..].rfind(':') {
        Some(colon) => &name_tag[..last_slash + colon],
        None => name_tag,
    }
}

fn split_registry_repository(token: &str, name: &str) -> Result<(String, String), ParseError> {
    let (registry, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            if let Some(found) = first.chars().find(|c| !is_host_char(*c)) {
                return Err(invalid(token, found));
            }
            (normalize_host(first), rest)
        }
        _ => (DEFAULT_REGISTRY.to_string(), name),
    };

    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(invalid(token, '/'));
        }
        if let Some(found) = segment.chars().find(|c| !is_path_char(*c)) {
            return Err(invalid(token, found));
        }
    }

    let repository = if registry == DEFAULT_REGISTRY && !path.contains('/') {
        format!("library/{path}")
    } else {
        path.to_string()
    };

    Ok((registry, repository))
}

fn parse_digest(token: &str, digest: &str) -> Result<String, ParseError> {
    let malformed = |detail| ParseError::MalformedDigest {
        token: token.to_string(),
        detail,
    };

    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| malformed("expected algorithm:hex"))?;

    if algorithm.is_empty()
        || !algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
    {
        return Err(malformed("invalid algorithm"));
    }
    if encoded.is_empty()
        || !encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '=' || c == '_' || c == '-')
    {
        return Err(malformed("invalid encoded value"));
    }
    if algorithm == "sha256"
        && (encoded.len() != 64
            || !encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)))
    {
        return Err(malformed("sha256 digest must be 64 lowercase hex characters"));
    }

    Ok(digest.to_string())
}

fn validate_tag(token: &str, tag: &str) -> Result<(), ParseError> {
    if tag.is_empty() || tag.starts_with('.') || tag.starts_with('-') {
        return Err(invalid(token, ':'));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(invalid(token, tag.chars().nth(MAX_TAG_LEN).unwrap_or(':')));
    }
    match tag
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.' || *c == '-'))
    {
        Some(found) => Err(invalid(token, found)),
        None => Ok(()),
    }
}

/// Lower-case `host` and fold Docker Hub aliases into [`DEFAULT_REGISTRY`].
pub fn normalize_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DEFAULT_REGISTRY.to_string()
    } else {
        host
    }
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ':'
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-'
}

fn invalid(token: &str, found: char) -> ParseError {
    ParseError::InvalidCharacter {
        token: token.to_string(),
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_explicit_registry_and_tag() {
        let r = ImageReference::parse("docker.io/library/nginx:1.21").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("1.21"));
    }

    #[test]
    fn test_default_tag_and_host_normalize_together() {
        let a = ImageReference::parse("nginx").unwrap();
        let b = ImageReference::parse("docker.io/library/nginx:latest").unwrap();
        let c = ImageReference::parse("index.docker.io/library/nginx").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_registry_with_port() {
        let r = ImageReference::parse("registry.local:5000/team/app:v2").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn test_localhost_is_a_host() {
        let r = ImageReference::parse("localhost/app").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "app");
    }

    #[test]
    fn test_first_segment_without_dot_is_path() {
        let r = ImageReference::parse("bitnami/redis:7.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "bitnami/redis");
    }

    #[test]
    fn test_deep_repository_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/sub/image");
    }

    #[test]
    fn test_digest_only_has_no_tag() {
        let r = ImageReference::parse(&format!("quay.io/app@{SHA}")).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(SHA));
        assert_eq!(r.push_tag(), SHA.replace(':', "-"));
    }

    #[test]
    fn test_tag_and_digest() {
        let r = ImageReference::parse(&format!("quay.io/app:1.0@{SHA}")).unwrap();
        assert_eq!(r.tag.as_deref(), Some("1.0"));
        assert_eq!(r.digest.as_deref(), Some(SHA));
    }

    #[test]
    fn test_host_is_lowercased() {
        let r = ImageReference::parse("GHCR.IO/org/app:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(ImageReference::parse("   "), Err(ParseError::Empty));
        assert_eq!(ParseError::Empty.reason(), "empty token");
    }

    #[test]
    fn test_rejects_template_placeholder() {
        let err = ImageReference::parse("nginx:{{ .Values.tag }}").unwrap_err();
        assert_eq!(err.reason(), "invalid character");
        let err = ImageReference::parse("{{ .Values.image }}").unwrap_err();
        assert_eq!(err.reason(), "invalid character");
    }

    #[test]
    fn test_rejects_uppercase_repository() {
        let err = ImageReference::parse("docker.io/Library/Nginx").unwrap_err();
        assert_eq!(err.reason(), "invalid character");
    }

    #[test]
    fn test_rejects_empty_segments_and_tags() {
        assert!(ImageReference::parse("ghcr.io//app").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_rejects_malformed_digest() {
        for token in ["nginx@sha256", "nginx@sha256:xyz", "nginx@:abc", "nginx@sha256:ABCDEF"] {
            let err = ImageReference::parse(token).unwrap_err();
            assert_eq!(err.reason(), "malformed digest", "{token}");
        }
    }

    #[test]
    fn test_display_round_trip_is_stable() {
        let tokens = [
            "nginx",
            "nginx:1.21",
            "bitnami/redis",
            "localhost:5000/app",
            "GHCR.io/org/sub/app:v1.0-rc_1",
            "registry-1.docker.io/library/busybox",
        ];
        let with_digest = format!("quay.io/app:1.0@{SHA}");
        for token in tokens.iter().copied().chain([with_digest.as_str()]) {
            let once = ImageReference::parse(token).unwrap();
            let twice = ImageReference::parse(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{token}");
        }
    }

    #[test]
    fn test_with_registry_keeps_path_and_tag() {
        let r = ImageReference::parse("docker.io/library/nginx:1.21").unwrap();
        let target = r.with_registry("corp.example.com");
        assert_eq!(target.to_string(), "corp.example.com/library/nginx:1.21");
        assert_eq!(target.tagged_name(), "corp.example.com/library/nginx:1.21");
    }

    #[test]
    fn test_written_name_drops_tag_and_digest_only() {
        assert_eq!(written_name("nginx:1.21"), "nginx");
        assert_eq!(written_name("bitnami/redis"), "bitnami/redis");
        assert_eq!(written_name("localhost:5000/app"), "localhost:5000/app");
        assert_eq!(written_name(&format!("quay.io/org/api:2@{SHA}")), "quay.io/org/api");
        assert_eq!(written_name("docker.io/library/nginx"), "docker.io/library/nginx");
    }

    #[test]
    fn test_normalize_host_folds_hub_aliases() {
        assert_eq!(normalize_host("Index.Docker.io"), "docker.io");
        assert_eq!(normalize_host("Corp.Example.com:5000"), "corp.example.com:5000");
    }

    #[test]
    fn test_validate_host() {
        assert!(validate_host("corp.example.com:5000").is_ok());
        assert!(validate_host("corp.example.com/mirror").is_err());
        assert!(validate_host("").is_err());
    }
}
