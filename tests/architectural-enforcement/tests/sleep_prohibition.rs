//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep. Rate-limit cooldowns are
//! computed from stored instants, upstream timeouts wrap the I/O itself and
//! periodic work uses `tokio::time::interval`.
//! **Exceptions**: test code (`#[cfg(test)]` sections and `tests/` dirs)

use architectural_enforcement::find_violations;

#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_violations(|code| code.contains("::sleep(") || code.contains(".sleep("));

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse I/O readiness, tokio::time::timeout or tokio::time::interval instead.");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
