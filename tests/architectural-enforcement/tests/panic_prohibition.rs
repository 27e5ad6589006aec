//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates errors (`?`, `thiserror` enums,
//! `anyhow` in binaries) instead of calling `unwrap()` or `expect()`.
//! A relay request must never take the daemon down.
//! **Exceptions**: test code

use architectural_enforcement::find_violations;

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = find_violations(|code| code.contains(".unwrap()") || code.contains(".expect("));

    if !violations.is_empty() {
        eprintln!("\nunwrap()/expect() found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }

        panic!(
            "\nFound {} panic site(s) in production code.",
            violations.len()
        );
    }
}
