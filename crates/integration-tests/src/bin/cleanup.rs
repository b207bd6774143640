//! Cleanup utility for integration test resources
//!
//! Removes domains and networks whose names carry the integration test prefix.

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use xshell::{cmd, Shell};

use integration_tests::{is_test_resource, TEST_PREFIX};

fn virtforge_path() -> Result<String> {
    if let Ok(path) = std::env::var("VIRTFORGE_PATH") {
        return Ok(path);
    }
    // Should be in the same directory as this cleanup binary
    let current_exe = std::env::current_exe()?;
    let candidate = current_exe
        .parent()
        .ok_or_else(|| eyre!("Failed to get parent directory"))?
        .join("virtforge");
    if candidate.exists() {
        return candidate
            .into_os_string()
            .into_string()
            .map_err(|p| eyre!("Non UTF-8 path: {:?}", p));
    }
    Ok("virtforge".to_owned())
}

fn listed_names(sh: &Shell, bin: &str, args: &[&str]) -> Result<Vec<String>> {
    let stdout = cmd!(sh, "{bin} {args...} --format json")
        .read()
        .with_context(|| format!("Listing with {args:?}"))?;
    let value: serde_json::Value = serde_json::from_str(&stdout)?;
    Ok(value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e["name"].as_str())
                .filter(|n| is_test_resource(n))
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let sh = Shell::new()?;
    let bin = virtforge_path()?;

    println!("Cleaning up resources prefixed with {TEST_PREFIX}...");
    let mut domains = listed_names(&sh, &bin, &["list"])?;
    // Clones before the instances backing them.
    domains.sort_by_key(|d| !d.contains("-copy-"));
    let mut failed = 0;
    for domain in &domains {
        print!("  Removing domain {}... ", domain);
        match cmd!(sh, "{bin} rm --force {domain}").quiet().ignore_stderr().run() {
            Ok(()) => println!("✓"),
            Err(e) => {
                println!("✗ ({e})");
                failed += 1;
            }
        }
    }

    let networks = listed_names(&sh, &bin, &["net", "list"])?;
    for network in &networks {
        print!("  Removing network {}... ", network);
        match cmd!(sh, "{bin} net rm {network}").quiet().ignore_stderr().run() {
            Ok(()) => println!("✓"),
            Err(e) => {
                println!("✗ ({e})");
                failed += 1;
            }
        }
    }

    println!(
        "Cleanup completed: {} domain(s), {} network(s), {} failure(s)",
        domains.len(),
        networks.len(),
        failed
    );
    Ok(())
}
