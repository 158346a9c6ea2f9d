// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Semantic version handling for service lookups.

use semver::{Version, VersionReq};

use crate::discovery::DiscoveryError;

/// Split `name@version` into the service name and a compatibility requirement. A bare name has
/// no requirement.
pub fn parse_versioned_name(name: &str) -> Result<(String, Option<VersionReq>), DiscoveryError> {
    match name.split_once('@') {
        None => Ok((name.to_string(), None)),
        Some((name, version)) => {
            let version = coerce_version(version)?;
            Ok((name.to_string(), Some(compatible(&version))))
        },
    }
}

/// Parse a possibly-partial version like `1` or `1.2`, padding missing parts with zeroes.
pub fn coerce_version(version: &str) -> Result<Version, DiscoveryError> {
    let padded = match version.split('.').count() {
        1 => format!("{}.0.0", version),
        2 => format!("{}.0", version),
        _ => version.to_string(),
    };
    Version::parse(&padded).map_err(|e| DiscoveryError::InvalidVersion(version.to_string(), e.to_string()))
}

/// The compatibility requirement for a requested version: `>=v, <next_major(v)`.
pub fn compatible(version: &Version) -> VersionReq {
    VersionReq::parse(&format!(">={}, <{}.0.0", version, version.major + 1))
        .expect("generated requirement is always valid")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_name_has_no_requirement() {
        let (name, req) = parse_versioned_name("echo").unwrap();
        assert_eq!(name, "echo");
        assert!(req.is_none());
    }

    #[test]
    fn partial_versions_are_coerced() {
        assert_eq!(coerce_version("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(coerce_version("1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(coerce_version("1.2.3").unwrap(), Version::new(1, 2, 3));
        assert!(coerce_version("nope").is_err());
    }

    #[test]
    fn compatible_matches_same_major_at_or_above() {
        let req = compatible(&Version::new(1, 2, 0));
        assert!(req.matches(&Version::new(1, 2, 0)));
        assert!(req.matches(&Version::new(1, 5, 0)));
        assert!(!req.matches(&Version::new(1, 1, 9)));
        assert!(!req.matches(&Version::new(2, 1, 0)));
    }

    #[test]
    fn versioned_name_parses() {
        let (name, req) = parse_versioned_name("foo@1.2").unwrap();
        assert_eq!(name, "foo");
        let req = req.unwrap();
        assert!(req.matches(&Version::new(1, 5, 0)));
        assert!(!req.matches(&Version::new(2, 1, 0)));
    }
}
