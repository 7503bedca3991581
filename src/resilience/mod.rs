// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with backoff and circuit breaking for backend calls.

pub mod circuit_breaker;
pub mod retry;
