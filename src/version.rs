//! Build-time version info, injected via build.rs.

/// Release version string (set at build time).
pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash (set at build time via env, or "unknown").
pub fn git_commit() -> &'static str {
    option_env!("GIT_COMMIT").unwrap_or("unknown")
}

/// Full version string with platform info.
pub fn full() -> String {
    format!(
        "{} (commit: {}, {}/{})",
        RELEASE,
        git_commit(),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_contains_release_and_platform() {
        let v = full();
        assert!(v.starts_with(RELEASE));
        assert!(v.contains(std::env::consts::ARCH));
        assert!(v.contains("commit: "));
    }
}
