//! Integration tests for the provenance stack
//!
//! This test suite validates:
//! - The full create, encrypt, sign, timestamp, audit and verify flow
//! - Key rotation with signers on both sides of the rotation
//! - Keyring persistence, restart and backup snapshots
//! - Tamper detection across every record layer
//! - Concurrent appends and encryption during rotation

pub mod test_utils;

#[cfg(test)]
mod provenance_flow_tests;

#[cfg(test)]
mod key_rotation_tests;

#[cfg(test)]
mod tamper_detection_tests;
