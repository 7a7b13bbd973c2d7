//! `shelley version` / `GET /version`: build identity for matching deployed
//! binaries against source, with no build-script dependency.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub commit: String,
    pub commit_time: String,
    pub modified: bool,
}

/// Falls back to `"unknown"` when the build wasn't run with these vars set
/// (e.g. `cargo build` outside CI). Set them via `SHELLEY_BUILD_COMMIT`,
/// `SHELLEY_BUILD_COMMIT_TIME`, `SHELLEY_BUILD_MODIFIED` at compile time
/// (`env!`/`option_env!` read the *build-time* environment, not runtime).
pub fn current() -> VersionInfo {
    VersionInfo {
        commit: option_env!("SHELLEY_BUILD_COMMIT")
            .unwrap_or("unknown")
            .to_string(),
        commit_time: option_env!("SHELLEY_BUILD_COMMIT_TIME")
            .unwrap_or("unknown")
            .to_string(),
        modified: option_env!("SHELLEY_BUILD_MODIFIED") == Some("true"),
    }
}
