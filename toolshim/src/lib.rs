// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod engine;
pub mod finish;
pub mod markers;
pub mod message;
pub mod parser;
pub mod prompt;
pub mod proxy;
pub mod stream;
pub mod trace;
pub mod transform;
