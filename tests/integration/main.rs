//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one part of the RPC
//! stack with two endpoints talking over an in-process link. All tests run
//! on the host with no external peer required.

mod callback_tests;
mod harness;
mod nesting_tests;
mod notify_tests;
mod transport_tests;
