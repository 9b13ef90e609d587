/// Panic with an internal assertion message when the condition is false.
///
/// Used for invariant violations (dangling references, ordering faults in
/// comparators, missing metadata rows). These indicate a programming fault:
/// continuing could return incorrect query results, so the operation is
/// terminated loudly instead of the error being swallowed or retried.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        panic!("{}", assertion_error(message));
    }
}

/// Unconditional invariant failure.
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

/// Build the string used when raising assertion errors.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!("INTERNAL ASSERTION FAILED: {}", message.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED")]
    fn hard_assert_panics_on_false() {
        hard_assert(false, "should panic");
    }

    #[test]
    fn assertion_error_formats_message() {
        let err = assertion_error("boom");
        assert!(err.contains("INTERNAL ASSERTION FAILED"));
        assert!(err.contains("boom"));
    }
}
