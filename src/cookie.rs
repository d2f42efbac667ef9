// File: cookie.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use log::warn;

// A deliberately small jar: domain + path + name key with last-write-wins
// values. Expiry, Secure and HttpOnly attributes are not tracked; the jar
// only has to carry state between positions of one worker's queue.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    entries: Vec<CookieEntry>,
}

#[derive(Debug, Clone)]
struct CookieEntry {
    domain: String,
    path: String,
    name: String,
    value: String,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, domain: &str, path: &str, name: &str, value: &str) {
        for entry in self.entries.iter_mut() {
            if entry.domain == domain && entry.path == path && entry.name == name {
                entry.value = value.to_string();
                return;
            }
        }
        self.entries.push(CookieEntry {
            domain: domain.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    pub fn get(&self, domain: &str, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.domain == domain && e.name == name)
            .map(|e| e.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pairs_for(&self, domain: &str, path: &str) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|e| e.domain == domain && path.starts_with(e.path.as_str()))
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    // Cookie header value for a request to `domain` + `path`, or None when
    // nothing matches.
    pub fn header_for(&self, domain: &str, path: &str) -> Option<String> {
        let pairs = self.pairs_for(domain, path);
        if pairs.is_empty() {
            None
        } else {
            Some(
                pairs
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    }

    // Ingests a request Cookie header that was sent over the wire, so later
    // positions keep presenting the same cookies.
    pub fn store_cookie_header(&mut self, domain: &str, header: &str) {
        for part in header.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => {
                    self.set(domain, "/", name.trim(), value.trim());
                }
                None => {
                    // Cookies need a name and a value per RFC 6265.
                    warn!("cookie header entry '{}' missing a '='", part);
                }
            }
        }
    }

    // Ingests one Set-Cookie response header. Only the first pair and the
    // Path attribute are honored.
    pub fn store_set_cookie(&mut self, domain: &str, header: &str) {
        let mut parts = header.split(';');

        let pair = match parts.next() {
            Some(p) => p.trim(),
            None => return,
        };
        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => {
                warn!("Set-Cookie entry '{}' missing a '='", pair);
                return;
            }
        };

        let mut path = "/".to_string();
        for attr in parts {
            if let Some((attr_name, attr_value)) = attr.split_once('=') {
                if attr_name.trim().eq_ignore_ascii_case("path") {
                    path = attr_value.trim().to_string();
                }
            }
        }

        self.set(domain, &path, name, value);
    }
}
