//! Scenario tests for the dispatch engine
//!
//! Unit tests live next to the code they cover; these exercise several
//! components together against scripted providers and mock HTTP servers.

pub mod support;

pub mod dispatch_tests;
pub mod reload_tests;
