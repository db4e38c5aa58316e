// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod action;
mod error;
mod message;
mod os;
mod usage;

pub use action::{Action, MouseButton, Point};
pub use error::{PortError, ValidationError};
pub use message::{
    parse_data_url_parts, retain_recent_screenshots, ContentPart, Message, UserContent,
    SCREENSHOT_ELIDED,
};
pub use os::OsType;
pub use usage::Usage;
