use std::process::Command;

fn main() {
    // Migrations are embedded with diesel_migrations::embed_migrations!
    println!("cargo:rerun-if-changed=migrations/");

    // embed git description in executable, referenced with env!()
    let git_hash = Command::new("git")
        .args(["describe", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");
    println!("cargo:rustc-env=BUILD_TIME_GIT_HASH={git_hash}");
}
