use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");

    let commit = git(&["rev-parse", "--short=8", "HEAD"]);
    let dirty = match git(&["status", "--porcelain"]).as_str() {
        "" => "",
        "unknown" if commit == "unknown" => "",
        _ => "-dirty",
    };
    println!("cargo:rustc-env=RALPH_GIT_COMMIT={commit}{dirty}");
}

/// Trimmed stdout, or "unknown" outside a git checkout.
fn git(args: &[&str]) -> String {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
