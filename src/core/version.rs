//! Build metadata and version comparison.
//! Includes the generated version.rs from the build script so every module
//! reads the same values.

include!(concat!(env!("OUT_DIR"), "/version.rs"));

use semver::Version;

/// Host version in the `vMAJOR.MINOR.PATCH` form plugins declare against
pub fn host_version() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

/// Build time string from the build script (UTC)
pub fn build_time() -> &'static str {
    BUILD_TIME
}

/// Short git hash captured by the build script
pub fn git_hash() -> &'static str {
    GIT_HASH
}

/// Parse `v1.2.3`, `1.2`, `1` and the like into a semver version
///
/// Missing minor or patch components are treated as zero.
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = Version::parse(trimmed) {
        return Some(v);
    }

    // Pad short forms, keeping any pre-release or build suffix
    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let parts = core.split('.').count();
    if parts == 0 || parts > 3 {
        return None;
    }
    let padded = format!("{core}{}{suffix}", ".0".repeat(3 - parts));
    Version::parse(&padded).ok()
}

/// True unless `host` is strictly older than `minimum`
///
/// An empty or unparsable minimum places no constraint on the host.
pub fn satisfies_minimum(host: &str, minimum: &str) -> bool {
    let Some(min) = parse_version(minimum) else {
        if !minimum.trim().is_empty() {
            log::warn!("Ignoring unparsable minimum host version '{}'", minimum);
        }
        return true;
    };
    match parse_version(host) {
        Some(host) => host >= min,
        None => {
            log::warn!("Host version '{}' is not semver; skipping check", host);
            true
        }
    }
}

/// True when `candidate` is a strictly newer version than `current`
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (parse_version(candidate), parse_version(current)) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_version_has_v_prefix() {
        let v = host_version();
        assert!(v.starts_with('v'), "got {v}");
        assert!(parse_version(&v).is_some());
    }

    #[test]
    fn test_parse_short_forms() {
        assert_eq!(parse_version("v1.2"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_version("3"), Some(Version::new(3, 0, 0)));
        assert_eq!(parse_version("v0.1.0"), Some(Version::new(0, 1, 0)));
        assert!(parse_version("").is_none());
        assert!(parse_version("latest").is_none());
    }

    #[test]
    fn test_minimum_version_comparison() {
        assert!(!satisfies_minimum("v0.1.0", "v9.9.9"));
        assert!(satisfies_minimum("v0.1.0", "v0.1.0"));
        assert!(satisfies_minimum("v1.0.0", "v0.9"));
        assert!(satisfies_minimum("v0.1.0", ""), "empty minimum never blocks");
        assert!(satisfies_minimum("v0.1.0", "not-a-version"));
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("0.2.0", "v0.1.0"));
        assert!(!is_newer("v0.1.0", "0.1.0"));
        assert!(!is_newer("garbage", "v0.1.0"));
    }
}
