//! Admin service and route tests.
