// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod env;
mod loader;
mod schema;

pub use env::EnvSnapshot;
pub use loader::load;
pub use schema::*;
