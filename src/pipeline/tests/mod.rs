//! Unit tests for stage handlers, routing, and dispatch.
