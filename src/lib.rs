//! # kitchensink-mutants
//!
//! `kitchensink-mutants` runs externally generated mutants against a project's test suite and
//! resolves each one to killed, survived, timed out, uncovered or failed. It is organized around:
//! - `mutation::channel`: length-prefixed UTF-16 frames between the orchestrator and a test host
//! - `mutation::testset` / `mutation::result` / `mutation::mutant`: tests, run results, mutants
//!   and coverage
//! - `mutation::timeout`: timeouts calibrated from the unmutated baseline run
//! - `mutation::scheduler`: coverage-based test selection, batching and status resolution
//! - `mutation::runner` / `mutation::host`: the test runner contract and its process-backed
//!   implementation
//!
//! Mutation generation, build discovery and report rendering live outside this crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod mutation;
pub mod prelude;
