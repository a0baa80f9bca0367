//! Tracing initialization sets the process-global subscriber, so this test
//! lives in its own binary to avoid clashing with `#[traced_test]` unit tests.

use restraint_core::observability::init_tracing;
use restraint_core::types::ObservabilityConfig;

#[test]
fn init_tracing_is_idempotent() {
    let config = ObservabilityConfig::default();
    init_tracing(&config);
    init_tracing(&config);
}
