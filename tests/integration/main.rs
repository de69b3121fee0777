//! Integration tests that touch the host: config files on disk and, with the
//! `integration-tests` feature, the real desktop clipboard

mod clipboard_tests;
mod config_tests;
