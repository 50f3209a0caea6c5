// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use camera_postproc::constants::{self, JpegRotation};

#[test]
fn test_rotation_roundtrips_degrees() {
    for rotation in JpegRotation::ALL {
        assert_eq!(JpegRotation::from_degrees(rotation.degrees()), rotation);
    }
}

#[test]
fn test_offline_slots_are_distinct() {
    // Metadata and input mappings share a stream and must not collide
    assert_ne!(
        constants::OFFLINE_META_BUF_INDEX,
        constants::OFFLINE_INPUT_BUF_INDEX
    );
    assert!(constants::OFFLINE_REPROC_NUM_BUFS > constants::OFFLINE_INPUT_BUF_INDEX);
}

#[test]
fn test_store_template_has_counter() {
    assert!(constants::STORE_FILE_TEMPLATE.contains("{}"));
    assert!(constants::FALLBACK_STORE_LOCATION.contains("{}"));
}

#[test]
fn test_version_is_set() {
    assert!(!constants::app_info::version().is_empty());
}
