// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! HTTP/1.1 wire grammar: head parsing and chunked transfer-coding,
//! grounded in `original_source/include/ircd/http.h`
//! (`http::response::head`, `http::response::chunk`) but realized with
//! `httparse` rather than a hand-rolled grammar, the way
//! `other_examples/19f221c2_hyperium-hyper__src-client-conn-http1.rs.rs`
//! and the xitca-web h1 dispatcher do.

pub mod chunked;
pub mod head;
