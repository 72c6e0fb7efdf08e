use anyhow::{Context, Result};
use chrono::TimeZone;
use std::env;
use std::fs;
use std::process::Command;
use vergen_gitcl::{Emitter, GitclBuilder};

const LIBRARY: &str = "audiotunnel";

fn main() -> Result<()> {
    // Generate git information
    let gitcl = GitclBuilder::default()
        .describe(true, true, Some("[0-9]*"))
        .build()?;

    let gitcl_res = Emitter::default()
        .idempotent()
        .fail_on_error()
        .add_instructions(&gitcl)
        .and_then(|emitter| emitter.emit());

    if let Err(e) = gitcl_res {
        eprintln!("error occurred while generating instructions: {e:?}");
        Emitter::default().idempotent().fail_on_error().emit()?;
    }

    // Build timestamp, reproducible when SOURCE_DATE_EPOCH is set
    let now = match env::var("SOURCE_DATE_EPOCH") {
        Ok(val) => {
            let secs = val
                .parse::<i64>()
                .context("SOURCE_DATE_EPOCH is not an integer")?;
            chrono::Utc
                .timestamp_opt(secs, 0)
                .single()
                .context("SOURCE_DATE_EPOCH is out of range")?
        }
        Err(_) => chrono::Utc::now(),
    };

    println!(
        "cargo:rustc-env=BUILD_TIMESTAMP={}",
        now.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let version = library_version_from_metadata()
        .or_else(|_| library_version_fallback())
        .unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=AUDIOTUNNEL_VERSION={version}");

    println!("cargo:rerun-if-changed={LIBRARY}/Cargo.toml");

    Ok(())
}

/// Library version from `cargo metadata`, for both path and registry
/// dependencies.
fn library_version_from_metadata() -> Result<String> {
    let output = Command::new(env::var("CARGO").unwrap_or_else(|_| "cargo".to_string()))
        .args(["metadata", "--format-version", "1"])
        .output()?;

    if !output.status.success() {
        anyhow::bail!("cargo metadata failed");
    }

    let metadata: serde_json::Value = serde_json::from_slice(&output.stdout)?;

    let packages = metadata["packages"].as_array().into_iter().flatten();
    for package in packages {
        if package["name"].as_str() == Some(LIBRARY) {
            if let Some(version) = package["version"].as_str() {
                return Ok(version.to_string());
            }
        }
    }

    // Registry ids look like "audiotunnel 0.3.0 (registry+...)"
    let nodes = metadata["resolve"]["nodes"].as_array().into_iter().flatten();
    for node in nodes {
        let mut parts = node["id"].as_str().unwrap_or_default().split(' ');
        if parts.next() == Some(LIBRARY) {
            if let Some(version) = parts.next() {
                return Ok(version.to_string());
            }
        }
    }

    anyhow::bail!("{LIBRARY} package not found in metadata");
}

/// Reads the version line of the library manifest directly.
fn library_version_fallback() -> Result<String> {
    let manifest = format!("{LIBRARY}/Cargo.toml");
    let toml_content = fs::read_to_string(&manifest)?;

    for line in toml_content.lines() {
        let line = line.trim();
        if !line.starts_with("version") {
            continue;
        }
        if let Some((_, value)) = line.split_once('=') {
            return Ok(value.trim().trim_matches('"').trim_matches('\'').to_string());
        }
    }

    anyhow::bail!("Could not find version in {manifest}");
}
