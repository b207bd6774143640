//! Integration tests for virtforge
//!
//! These run the `virtforge` binary against a real libvirt host. Tests that
//! need a template read its name from `VIRTFORGE_TEST_TEMPLATE` and are
//! skipped when it is unset.

use camino::Utf8Path;
use std::process::Output;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

pub(crate) use integration_tests::{integration_test, unique_name, INTEGRATION_TESTS};

mod tests {
    pub mod host;
    pub mod lifecycle;
    pub mod network;
}

/// Get the path to the virtforge binary, checking VIRTFORGE_PATH first
pub(crate) fn get_virtforge_command() -> Result<String> {
    if let Ok(path) = std::env::var("VIRTFORGE_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/virtforge", "target/release/virtforge"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VIRTFORGE_PATH={path} to run using this binary"
        ));
    }
    Ok("virtforge".to_owned())
}

/// Template used by tests that create instances, if configured
pub(crate) fn get_test_template() -> Option<String> {
    std::env::var("VIRTFORGE_TEST_TEMPLATE").ok()
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Create from a raw Output
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.output.status.success()
    }

    /// Parse stdout as JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.stdout)
            .map_err(|e| eyre!("Invalid JSON output ({e}): {}", self.stdout))
    }
}

/// Run the virtforge binary, capturing output
pub(crate) fn run_virtforge(args: &[&str]) -> Result<CapturedOutput> {
    let bin = get_virtforge_command()?;
    let output = std::process::Command::new(&bin).args(args).output()?;
    Ok(CapturedOutput::new(output))
}

/// Removes a domain when dropped, so failed tests do not leak instances
pub(crate) struct DomainCleanup(pub String);

impl Drop for DomainCleanup {
    fn drop(&mut self) {
        if let Ok(out) = run_virtforge(&["rm", "--force", &self.0]) {
            if !out.success() && !out.stderr.contains("[domain-not-found]") {
                eprintln!("Warning: failed to remove {}: {}", self.0, out.stderr);
            }
        }
    }
}

fn main() {
    let args = Arguments::from_args();

    // Collect tests from the distributed slice
    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    // Run the tests and exit with the result
    libtest_mimic::run(&args, tests).exit();
}
