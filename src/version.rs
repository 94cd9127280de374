//! Build version reported by the `orgcheck` binary.

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git branch at build time, or "unknown" outside a checkout.
pub const GIT_BRANCH: &str = match option_env!("VERGEN_GIT_BRANCH") {
    Some(branch) => branch,
    None => "unknown",
};

/// Short commit SHA at build time, or "unknown" outside a checkout.
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// Version string such as `0.1.0+main.abc1234` (`.dirty` appended when the
/// tree had local changes).
pub fn version_string() -> String {
    let sha = GIT_SHA.get(..7).unwrap_or(GIT_SHA);
    let dirty = option_env!("VERGEN_GIT_DIRTY") == Some("true");
    format!(
        "{PKG_VERSION}+{GIT_BRANCH}.{sha}{}",
        if dirty { ".dirty" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_package_version() {
        let version = version_string();
        assert!(version.starts_with(&format!("{PKG_VERSION}+{GIT_BRANCH}.")));
    }
}
