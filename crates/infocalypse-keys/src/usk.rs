//! Signed (SSK) and updatable (USK) subspace keys.
//!
//! A USK is a logically mutable name. The store resolves it by probing
//! `SSK@<key>/<name>-<version>` for increasing versions, so every USK
//! version maps onto exactly one SSK.

use std::fmt;
use std::str::FromStr;

use sha1::Digest;
use sha1::Sha1;

use crate::error::KeyError;
use crate::error::KeyResult;

const USK_PREFIX: &str = "USK@";
const SSK_PREFIX: &str = "SSK@";

/// Suffix of a repository name that has a redundant twin.
pub const REDUNDANT_SUFFIX: &str = ".R1";

/// Suffix of the redundant twin name.
pub const REDUNDANT_TWIN_SUFFIX: &str = ".R0";

/// Number of hex digits kept from the SHA-1 of a USK.
pub const USK_HASH_LEN: usize = 12;

fn check_key_material(uri: &str, key: &str) -> KeyResult<()> {
    let fields: Vec<&str> = key.split(',').collect();
    if fields.len() != 3 || fields.iter().any(|field| field.is_empty()) {
        return Err(KeyError::MalformedKey {
            uri: uri.to_string(),
            reason: "expected routing,crypto,extra".to_string(),
        });
    }
    Ok(())
}

/// An updatable subspace key: `USK@<key>/<name>/<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Usk {
    key: String,
    name: String,
    version: i64,
}

impl Usk {
    pub fn new(key: impl Into<String>, name: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            version,
        }
    }

    /// Parse `USK@<key>/<name>/<version>`. A trailing slash is tolerated.
    pub fn parse(uri: &str) -> KeyResult<Self> {
        let rest = uri.strip_prefix(USK_PREFIX).ok_or_else(|| KeyError::WrongKeyType {
            expected: "USK",
            uri: uri.to_string(),
        })?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let mut parts = rest.splitn(3, '/');
        let key = parts.next().unwrap_or_default();
        check_key_material(uri, key)?;

        let name = parts.next().filter(|name| !name.is_empty()).ok_or_else(|| KeyError::InvalidUskPath {
            uri: uri.to_string(),
            reason: "missing name".to_string(),
        })?;
        let version = parts.next().ok_or_else(|| KeyError::InvalidUskPath {
            uri: uri.to_string(),
            reason: "missing version".to_string(),
        })?;
        let version = version.parse::<i64>().map_err(|_| KeyError::InvalidUskPath {
            uri: uri.to_string(),
            reason: format!("version is not an integer: {version}"),
        })?;

        Ok(Self::new(key, name, version))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Same name at a different version.
    pub fn with_version(&self, version: i64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// Same name and version under a different key.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..self.clone()
        }
    }

    /// Same key under a different name.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// The SSK the store probes for `version`.
    pub fn to_ssk(&self, version: i64) -> Ssk {
        Ssk::new(self.key.clone(), format!("{}-{}", self.name, version))
    }

    /// True if the name follows the `.R1` redundancy convention.
    pub fn is_redundant(&self) -> bool {
        self.name.ends_with(REDUNDANT_SUFFIX)
    }

    /// All names a top-key is published under.
    ///
    /// `.R1` names yield themselves followed by the `.R0` twin. Other names
    /// yield only themselves.
    pub fn redundant_variants(&self) -> Vec<Usk> {
        match self.name.strip_suffix(REDUNDANT_SUFFIX) {
            Some(stem) => vec![self.clone(), self.with_name(format!("{stem}{REDUNDANT_TWIN_SUFFIX}"))],
            None => vec![self.clone()],
        }
    }

    /// First 12 hex digits of the SHA-1 of the key at version 0.
    ///
    /// Used to index per-repository settings independent of version.
    pub fn usk_hash(&self) -> String {
        let digest = Sha1::digest(self.with_version(0).to_string().as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(USK_HASH_LEN);
        hash
    }
}

impl fmt::Display for Usk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{USK_PREFIX}{}/{}/{}", self.key, self.name, self.version)
    }
}

impl FromStr for Usk {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A signed subspace key: `SSK@<key>/<docname>`.
///
/// Freshly generated keypairs have an empty docname and print as
/// `SSK@<key>/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ssk {
    key: String,
    docname: String,
}

impl Ssk {
    pub fn new(key: impl Into<String>, docname: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            docname: docname.into(),
        }
    }

    pub fn parse(uri: &str) -> KeyResult<Self> {
        let rest = uri.strip_prefix(SSK_PREFIX).ok_or_else(|| KeyError::WrongKeyType {
            expected: "SSK",
            uri: uri.to_string(),
        })?;
        let (key, docname) = rest.split_once('/').unwrap_or((rest, ""));
        check_key_material(uri, key)?;
        Ok(Self::new(key, docname))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn docname(&self) -> &str {
        &self.docname
    }

    /// The USK sharing this key.
    pub fn to_usk(&self, name: impl Into<String>, version: i64) -> Usk {
        Usk::new(self.key.clone(), name, version)
    }
}

impl fmt::Display for Ssk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SSK_PREFIX}{}/{}", self.key, self.docname)
    }
}

impl FromStr for Ssk {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "Gq-FBhpgvr11VGpapG~y0rGFOAHVfzyW1WoKGwK-fFw,MpzFUh5Rmw6N~aMKwm9h2Uk~6aTRhYaY0shXVotgBUc,AQACAAE";

    fn usk(name: &str, version: i64) -> Usk {
        Usk::new(KEY, name, version)
    }

    #[test]
    fn test_round_trip() {
        let uri = format!("USK@{KEY}/infocalypse.R1/17");
        let parsed = Usk::parse(&uri).expect("should parse");
        assert_eq!(parsed.name(), "infocalypse.R1");
        assert_eq!(parsed.version(), 17);
        assert_eq!(parsed.to_string(), uri);
    }

    #[test]
    fn test_negative_version() {
        let parsed = Usk::parse(&format!("USK@{KEY}/repo/-3")).expect("should parse");
        assert_eq!(parsed.version(), -3);
    }

    #[test]
    fn test_trailing_slash_tolerated() {
        let parsed = Usk::parse(&format!("USK@{KEY}/repo/2/")).expect("should parse");
        assert_eq!(parsed, usk("repo", 2));
    }

    #[test]
    fn test_missing_version_rejected() {
        let err = Usk::parse(&format!("USK@{KEY}/repo")).unwrap_err();
        assert!(matches!(err, KeyError::InvalidUskPath { .. }));
    }

    #[test]
    fn test_bad_key_material_rejected() {
        let err = Usk::parse("USK@abc,def/repo/1").unwrap_err();
        assert!(matches!(err, KeyError::MalformedKey { .. }));
    }

    #[test]
    fn test_to_ssk() {
        let ssk = usk("repo.R1", 5).to_ssk(5);
        assert_eq!(ssk.to_string(), format!("SSK@{KEY}/repo.R1-5"));
    }

    #[test]
    fn test_redundant_variants() {
        let variants = usk("repo.R1", 3).redundant_variants();
        assert_eq!(variants, vec![usk("repo.R1", 3), usk("repo.R0", 3)]);

        let single = usk("repo", 3).redundant_variants();
        assert_eq!(single, vec![usk("repo", 3)]);
    }

    #[test]
    fn test_usk_hash_ignores_version() {
        let hash = usk("repo.R1", 0).usk_hash();
        assert_eq!(hash.len(), USK_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, usk("repo.R1", 42).usk_hash());
        assert_ne!(hash, usk("repo.R0", 0).usk_hash());
    }

    #[test]
    fn test_generated_ssk_has_empty_docname() {
        let ssk = Ssk::parse(&format!("SSK@{KEY}/")).expect("should parse");
        assert_eq!(ssk.docname(), "");
        assert_eq!(ssk.to_usk("repo.R1", 0), usk("repo.R1", 0));
    }
}
