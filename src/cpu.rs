// SPDX-License-Identifier: MIT OR Apache-2.0

//! CPU-count probe for the default worker-pool size.

/// Number of logical CPUs available, used as the default `-t` value when
/// the user doesn't pass one.
#[must_use]
pub fn available_parallelism() -> usize {
    num_cpus::get()
}
