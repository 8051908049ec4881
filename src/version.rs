//! Version Reporting
//!
//! Build metadata for `fray version`. Commit and build date come from
//! `FRAY_COMMIT` / `FRAY_BUILD_DATE` set at compile time by the release
//! pipeline; local builds report "unknown".

use serde::Serialize;

/// Version information.
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub version: &'static str,
    pub commit: &'static str,
    pub build_date: &'static str,
    pub platform: String,
}

/// Build-time version information.
pub fn get() -> Info {
    Info {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("FRAY_COMMIT").unwrap_or("unknown"),
        build_date: option_env!("FRAY_BUILD_DATE").unwrap_or("unknown"),
        platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

impl std::fmt::Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.version, self.commit)
    }
}
