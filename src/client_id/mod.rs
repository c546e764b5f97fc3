// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client identification from proxy headers.
//!
//! The gateway normally runs behind one or more reverse proxies, so the TCP
//! peer address is useless as a rate-limit key. Instead we look at the
//! forwarding headers in order of specificity and take the first one that
//! carries a value.

use axum::http::HeaderMap;
use std::fmt;

/// Key used when no forwarding header is present.
pub const FALLBACK_CLIENT_KEY: &str = "unknown";

/// Headers consulted, most specific first.
const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const CONNECTING_IP: &str = "cf-connecting-ip";

/// Best-effort identity of a caller, used to partition rate limits.
///
/// Not guaranteed unique per physical client: every caller behind the same
/// NAT shares a key, and a caller that forges `x-forwarded-for` picks its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_CLIENT_KEY
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the client key from request headers.
///
/// Precedence: first entry of `x-forwarded-for` > `x-real-ip` >
/// `cf-connecting-ip` > `"unknown"`. Blank or non-ASCII values are skipped.
pub fn identify_client(headers: &HeaderMap) -> ClientKey {
    let forwarded = header_value(headers, FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| header_value(headers, REAL_IP))
        .or_else(|| header_value(headers, CONNECTING_IP))
        .map(ClientKey::new)
        .unwrap_or_else(|| ClientKey::new(FALLBACK_CLIENT_KEY))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
