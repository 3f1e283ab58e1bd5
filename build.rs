use chrono::Utc;
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Read `[package.metadata] plugin_api_version`, accepting either an integer
/// (`20261017`) or a string (`"2026-10-17"`).
fn plugin_api_version(manifest: &Path) -> String {
    let contents = match std::fs::read_to_string(manifest) {
        Ok(contents) => contents,
        Err(_) => return "unknown".to_string(),
    };
    let table = match contents.parse::<toml::Table>() {
        Ok(table) => table,
        Err(_) => return "unknown".to_string(),
    };
    let value = table
        .get("package")
        .and_then(|p| p.as_table())
        .and_then(|p| p.get("metadata"))
        .and_then(|m| m.as_table())
        .and_then(|m| m.get("plugin_api_version"));

    match value {
        Some(toml::Value::Integer(v)) => v.to_string(),
        Some(toml::Value::String(v)) => v.clone(),
        _ => "unknown".to_string(),
    }
}

fn git_hash() -> String {
    std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    let out_dir = env::var_os("OUT_DIR").expect("cargo sets OUT_DIR");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR");
    let dest_path = Path::new(&out_dir).join("version.rs");
    let cargo_toml_path = Path::new(&manifest_dir).join("Cargo.toml");

    let api_version = plugin_api_version(&cargo_toml_path);
    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_hash = git_hash();

    let mut f = File::create(&dest_path).expect("create version.rs");
    writeln!(
        &mut f,
        r###"pub const PLUGIN_API_VERSION: &str = "{api_version}";
pub const BUILD_TIME: &str = "{build_time}";
pub const GIT_HASH: &str = "{git_hash}";"###
    )
    .expect("write version.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
