// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod dispatch;
pub mod http;
pub mod p2p;

pub use dispatch::{AgentKwargs, Dispatcher, InputPayload, ResponsesReply, ResponsesRequest};
