// src/fixture/mod.rs

//! Fixtures: named setup/teardown providers consumed by tasks.
//!
//! - [`descriptor`] defines fixtures and their four builder shapes.
//! - [`registry`] looks fixtures up by name, validates the dependency graph
//!   and expands parameterized fixtures into task instances.
//! - [`cache`] memoizes built instances (single-flight) and counts consumers.
//! - [`resolver`] turns a task's argument names into values and undoes them.

pub mod cache;
pub mod descriptor;
pub mod registry;
pub mod resolver;

pub use cache::{CacheKey, FixtureCache, ScopeKey};
pub use descriptor::{
    downcast, fixture_value, AsyncTeardown, FixtureArgs, FixtureDescriptor, FixtureFn,
    FixtureValue, Request, SyncTeardown, Teardown, REQUEST_ARG,
};
pub use registry::FixtureRegistry;
pub use resolver::{FixtureResolver, Reservation, TaskFixtures, TeardownHandle};
