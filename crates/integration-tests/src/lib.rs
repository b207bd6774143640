//! Shared library code for integration tests
//!
//! This module contains constants and utilities that are shared between
//! the main test binary and helper binaries like cleanup.

// Unfortunately needed here to work with linkme
#![allow(unsafe_code)]

use linkme::distributed_slice;

/// Prefix of every domain, network and pool created by integration tests
pub const TEST_PREFIX: &str = "vf-itest-";

/// A test function that returns a Result
pub type TestFn = fn() -> color_eyre::Result<()>;

/// Metadata for a registered integration test
#[derive(Debug)]
pub struct IntegrationTest {
    /// Name of the integration test
    pub name: &'static str,
    /// Test function to execute
    pub f: TestFn,
}

impl IntegrationTest {
    /// Create a new integration test with the given name and function
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

/// Distributed slice holding all registered integration tests
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register an integration test with less boilerplate.
///
/// # Examples
///
/// ```ignore
/// fn test_host_report() -> Result<()> {
///     let output = run_virtforge(&["host", "report"])?;
///     output.assert_success("host report");
///     Ok(())
/// }
/// integration_test!(test_host_report);
/// ```
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        ::paste::paste! {
            #[distributed_slice($crate::INTEGRATION_TESTS)]
            static [<$fn_name:upper>]: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), $fn_name);
        }
    };
}

/// A fresh resource name carrying [`TEST_PREFIX`]
///
/// libvirt network names end up as bridge names, so keep the result short.
pub fn unique_name(kind: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{TEST_PREFIX}{kind}-{}", &id[..8])
}

/// Whether `name` was created by an integration test
pub fn is_test_resource(name: &str) -> bool {
    name.starts_with(TEST_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name() {
        let a = unique_name("vm");
        let b = unique_name("vm");
        assert!(a.starts_with("vf-itest-vm-"));
        assert_eq!(a.len(), "vf-itest-vm-".len() + 8);
        assert_ne!(a, b);
        assert!(is_test_resource(&a));
        assert!(!is_test_resource("web1"));
    }
}
