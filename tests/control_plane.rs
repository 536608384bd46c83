//! Multi-process control-plane scenario (`spec.md` §8: two secondaries each
//! lease a container, write into it, and release it; the primary's
//! aggregate buffer quota reflects both allocations and both releases).

#![cfg(feature = "control-plane")]

use nvfuse::control_plane::{PrimaryState, ReservationMode};

const MIB: u64 = 1024 * 1024;

#[test]
fn two_secondaries_lease_containers_and_quota_returns_to_baseline_on_release() {
    let bg_count = 8;
    let total_quota = 256 * MIB;
    let primary = PrimaryState::new(bg_count, total_quota);

    primary.register(1, "secondary-a").unwrap();
    primary.register(2, "secondary-b").unwrap();

    let bg_a = primary.alloc_container_new(1).unwrap();
    let bg_b = primary.alloc_container_new(2).unwrap();
    assert_ne!(bg_a, bg_b);

    let granted_a = primary.buffer_alloc(100 * MIB);
    let granted_b = primary.buffer_alloc(100 * MIB);
    assert_eq!(granted_a, 100 * MIB);
    assert_eq!(granted_b, 100 * MIB);

    primary.reservation_acquire(1, bg_a, ReservationMode::Write).unwrap();
    primary.reservation_acquire(2, bg_b, ReservationMode::Write).unwrap();

    // A third secondary cannot touch either container while it's write-locked.
    primary.register(3, "secondary-c").unwrap();
    assert!(primary.reservation_acquire(3, bg_a, ReservationMode::Read).is_err());

    primary.reservation_release(bg_a).unwrap();
    primary.reservation_release(bg_b).unwrap();
    primary.buffer_free(100 * MIB);
    primary.buffer_free(100 * MIB);

    primary.release_container(1, bg_a).unwrap();
    primary.release_container(2, bg_b).unwrap();

    assert_eq!(primary.buffer_alloc(total_quota), total_quota);
}

#[test]
fn persisted_app_and_container_tables_rotate_on_disk_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let primary = PrimaryState::with_log_dir(4, 64 * MIB, dir.path().to_path_buf());

    primary.register(10, "secondary-a").unwrap();
    let bg = primary.alloc_container_new(10).unwrap();
    primary.reservation_acquire(10, bg, ReservationMode::Write).unwrap();
    primary.reservation_release(bg).unwrap();

    assert!(dir.path().join("app_table_0.file").exists() || dir.path().join("app_table_1.file").exists());
    assert!(dir.path().join("container_table_0.file").exists() || dir.path().join("container_table_1.file").exists());
}
