// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! Federation-facing HTTP message broker core: a socket/link/tag/peer
//! stack driving outbound HTTP/1.1 requests to a destination's resolved
//! servers, dispatched from a single-threaded scheduler.

pub mod batch;
pub mod cfg;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod link;
pub mod peer;
pub mod request;
pub mod resolver;
pub mod socket;
pub mod state_machine;
pub mod tag;
pub mod utils;
pub mod wire;
