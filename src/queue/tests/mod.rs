//! Unit tests for the queue module.
//!
//! Tests are organised by layer: domain rules, queue service claim and
//! transition behaviour, and retry/escalation policy.
