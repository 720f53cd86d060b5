//! Stamps the binary with the commit it was built from, the build time (UTC)
//! and the cargo profile. All three are logged once at startup.

use std::process::Command;

/// Trimmed stdout of a successful `git` invocation
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let commit = git(&["describe", "--always", "--dirty", "--abbrev=8"])
        .unwrap_or_else(|| "unknown".to_string());
    let built_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=CITYRULES_GIT_HASH={}", commit);
    println!("cargo:rustc-env=CITYRULES_BUILD_TIMESTAMP={}", built_at);
    println!("cargo:rustc-env=CITYRULES_BUILD_PROFILE={}", profile);
}
