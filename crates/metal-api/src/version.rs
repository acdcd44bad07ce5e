/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit SHA (short)
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// Git commit timestamp
pub const GIT_COMMIT_TIMESTAMP: &str = env!("VERGEN_GIT_COMMIT_TIMESTAMP");

/// Git branch name
pub const GIT_BRANCH: &str = env!("VERGEN_GIT_BRANCH");

/// Whether the working tree had uncommitted changes
pub const GIT_DIRTY: &str = env!("VERGEN_GIT_DIRTY");

/// Rust compiler version used to build
pub const RUSTC_VERSION: &str = env!("VERGEN_RUSTC_SEMVER");

/// Build timestamp
pub const BUILD_TIMESTAMP: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// Target triple
pub const TARGET: &str = env!("VERGEN_CARGO_TARGET_TRIPLE");

/// Returns full version string with git metadata.
/// Format: <version> (<git_sha>) [dirty]
pub fn full_version() -> String {
    let dirty = if GIT_DIRTY == "true" { " dirty" } else { "" };
    format!("{VERSION} ({GIT_SHA}{dirty})")
}

/// Returns detailed build information for diagnostics.
pub fn build_info() -> String {
    format!(
        "metal-api {}\n\
         commit: {} ({})\n\
         branch: {}\n\
         built:  {}\n\
         rustc:  {}\n\
         target: {}\n\
         wait protocol: v{}",
        VERSION,
        GIT_SHA,
        GIT_COMMIT_TIMESTAMP,
        GIT_BRANCH,
        BUILD_TIMESTAMP,
        RUSTC_VERSION,
        TARGET,
        crate::wait::WAIT_PROTOCOL_VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_starts_with_crate_version() {
        assert!(full_version().starts_with(VERSION));
        assert!(build_info().starts_with("metal-api "));
    }

    #[test]
    fn test_git_metadata_is_always_embedded() {
        for value in [GIT_SHA, GIT_BRANCH, GIT_COMMIT_TIMESTAMP, GIT_DIRTY] {
            assert!(!value.is_empty());
        }
    }
}
