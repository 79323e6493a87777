//! Platform naming and asset selection
//!
//! Release assets carry Go-style platform names (`linux_amd64`,
//! `darwin_arm64`). Plugin assets are named `plugin_<version>_<os>_<arch>`
//! with an optional extension; host assets use a `kaytu_` prefix instead.

use super::Asset;
use regex::Regex;

/// Operating system and architecture as they appear in asset names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

/// An asset chosen for this platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAsset<'a> {
    pub asset: &'a Asset,
    pub version: String,
    /// Trailing extension such as `.exe`, empty when the asset has none
    pub extension: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64",
            other => other,
        };
        Self::new(os, arch)
    }

    fn asset_pattern(&self, prefix: &str) -> Option<Regex> {
        let pattern = format!(
            r"^{}_([a-z0-9.]+)_{}_{}((?:\.[A-Za-z0-9]+)*)$",
            regex::escape(prefix),
            regex::escape(&self.os),
            regex::escape(&self.arch)
        );
        Regex::new(&pattern)
            .map_err(|e| log::warn!("Invalid asset pattern '{}': {}", pattern, e))
            .ok()
    }

    fn select<'a>(&self, prefix: &str, assets: &'a [Asset]) -> Option<SelectedAsset<'a>> {
        let pattern = self.asset_pattern(prefix)?;
        assets.iter().find_map(|asset| {
            let caps = pattern.captures(&asset.name)?;
            Some(SelectedAsset {
                asset,
                version: caps.get(1)?.as_str().to_string(),
                extension: caps.get(2).map_or_else(String::new, |m| m.as_str().to_string()),
            })
        })
    }

    /// First plugin asset built for this platform
    pub fn select_plugin_asset<'a>(&self, assets: &'a [Asset]) -> Option<SelectedAsset<'a>> {
        self.select("plugin", assets)
    }

    /// First host binary asset built for this platform
    pub fn select_host_asset<'a>(&self, assets: &'a [Asset]) -> Option<SelectedAsset<'a>> {
        self.select("kaytu", assets)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)
    }
}
