//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used items from this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use kitchensink_mutants::prelude::*;
//! ```

pub use crate::mutation::{
    CancelToken, CoverageMode, HostCommand, HostTestRunner, Mutant, MutantId, MutantStatus,
    MutationOrchestrator, OrchestratorConfig, OrchestratorError, StatusReport, TestId,
    TestRunResult, TestRunner, TestSet, TestsGuidList,
};
