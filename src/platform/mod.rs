// SPDX-License-Identifier: MPL-2.0

//! Reference [`crate::facade::PlatformIrq`] implementations, gated behind
//! Cargo features. Nothing in C2-C5 depends on this module; it exists as a
//! worked example and integration-test fixture for one concrete host.

pub mod ostd_adapter;
