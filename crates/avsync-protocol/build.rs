use std::process::Command;

fn main() {
    // Git short hash
    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .unwrap_or_default();
    let git_hash = match git_hash.trim() {
        "" => "unknown",
        hash => hash,
    };
    println!("cargo:rustc-env=AVSYNC_GIT_HASH={}", git_hash);

    // Build timestamp (UTC)
    let build_time = Command::new("date")
        .args(["-u", "+%Y-%m-%d %H:%M UTC"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .unwrap_or_default();
    let build_time = match build_time.trim() {
        "" => "unknown",
        time => time,
    };
    println!("cargo:rustc-env=AVSYNC_BUILD_TIME={}", build_time);

    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/");
}
