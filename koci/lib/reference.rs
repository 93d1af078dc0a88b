//! Image references: `registry/repository` plus a tag or digest.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use getset::Getters;
use regex::Regex;

use crate::{Digest, KociError, KociResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed image reference: registry host, repository path, and either a tag,
/// a digest, or nothing.
///
/// Supported forms:
/// - `registry/repository:tag`
/// - `registry/repository@digest`
/// - `registry/repository:tag@digest` (the redundant tag is dropped)
/// - `registry/repository`
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Reference {
    /// The registry host, with an optional port.
    registry: String,

    /// The repository path within the registry.
    repository: String,

    /// The tag or digest string, or empty when neither was given.
    reference: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// Creates a validated reference from its three components.
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        reference: impl Into<String>,
    ) -> KociResult<Self> {
        let parsed = Self {
            registry: registry.into(),
            repository: repository.into(),
            reference: reference.into(),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Returns the digest this reference names, when it names one.
    pub fn digest(&self) -> Option<Digest> {
        if self.reference.contains(':') {
            self.reference.parse().ok()
        } else {
            None
        }
    }

    /// Returns true when the reference component is a tag.
    pub fn is_tag(&self) -> bool {
        !self.reference.is_empty() && !self.reference.contains(':')
    }

    fn validate(&self) -> KociResult<()> {
        validate_registry(&self.registry)?;
        validate_repository(&self.repository)?;
        if self.reference.is_empty() {
            return Ok(());
        }
        if self.reference.contains(':') {
            self.reference.parse::<Digest>()?;
            return Ok(());
        }
        validate_tag(&self.reference)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = KociError;

    /// Decodes a reference string. The first path segment is always the
    /// registry; a `@digest` suffix wins over a `:tag` suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (registry, rest) = s.split_once('/').unwrap_or((s, ""));

        let (repository, reference) = if let Some((pre, digest)) = rest.split_once('@') {
            // Form B carries a redundant tag before the digest; drop it.
            let repository = pre.split_once(':').map(|(repo, _)| repo).unwrap_or(pre);
            (repository, digest)
        } else if let Some((repository, tag)) = rest.split_once(':') {
            (repository, tag)
        } else {
            (rest, "")
        };

        Self::new(registry, repository, reference)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if self.reference.is_empty() {
            Ok(())
        } else if self.reference.contains(':') {
            write!(f, "@{}", self.reference)
        } else {
            write!(f, ":{}", self.reference)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates a registry host, which may carry a port suffix.
fn validate_registry(registry: &str) -> KociResult<()> {
    let re = Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").unwrap();
    if re.is_match(registry) {
        Ok(())
    } else {
        Err(KociError::InvalidRegistry(registry.to_string()))
    }
}

/// Validates a repository path against the distribution-spec grammar.
pub(crate) fn validate_repository(repository: &str) -> KociResult<()> {
    let re = Regex::new(
        r"^[a-z0-9]+(?:(?:[._]|__|-*)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-*)[a-z0-9]+)*)*$",
    )
    .unwrap();
    if re.is_match(repository) {
        Ok(())
    } else {
        Err(KociError::InvalidRepository(repository.to_string()))
    }
}

/// Validates a tag: a word character followed by up to 127 word, dot or dash
/// characters.
pub(crate) fn validate_tag(tag: &str) -> KociResult<()> {
    let re = Regex::new(r"^\w[\w.-]{0,127}$").unwrap();
    if re.is_match(tag) {
        Ok(())
    } else {
        Err(KociError::InvalidTag(tag.to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
