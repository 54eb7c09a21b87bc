use treacle_engine::fdlimit::{apply_fd_budget, effective_connection_target, RESERVED_FDS};

#[test]
fn test_target_fits_when_the_limit_has_headroom() {
    assert_eq!(effective_connection_target(500, 1024), 500);
    assert_eq!(effective_connection_target(500, 500 + RESERVED_FDS), 500);
}

#[test]
fn test_target_shrinks_to_what_the_limit_carries() {
    // 200 descriptors minus the reserve leaves room for 190 connections
    assert_eq!(effective_connection_target(500, 200), 190);
    assert_eq!(effective_connection_target(500, 509), 499);
}

#[test]
fn test_target_bottoms_out_at_zero() {
    assert_eq!(effective_connection_target(50, RESERVED_FDS), 0);
    assert_eq!(effective_connection_target(50, 3), 0);
}

#[test]
fn test_budget_for_a_tiny_pool_is_untouched() {
    // any sane environment has more than RESERVED_FDS + 1 descriptors
    assert_eq!(apply_fd_budget(1), 1);
}
