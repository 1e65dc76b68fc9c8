// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Next-hop routing: Request-URI decomposition, the downstream route memory,
//! and ordered upstream target resolution.

pub mod route;
pub mod upstream;
pub mod uri;

pub use route::{route_key, RouteMemory};
pub use upstream::{BindingSource, UpstreamResolver};
pub use uri::{parse_target, Target, DEFAULT_SIP_PORT};
