//! Shared mapping and row fixtures for unit tests
