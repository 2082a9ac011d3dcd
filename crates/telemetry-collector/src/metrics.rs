// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Running-instance gauges.
//!
//! Sessions report through the [`GaugeSink`] trait so the registry can be
//! swapped for a fake in tests. [`GaugeRegistry`] is the production sink: a
//! sharded map updated atomically per module key, rendered in the Prometheus
//! text exposition format by the exporter.

use crate::server::protocol::ModuleInfo;
use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Metric identity of one module: (name, version, build hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey {
    pub module: String,
    pub version: String,
    pub build_hash: String,
}

impl ModuleKey {
    pub fn new(
        module: impl Into<String>,
        version: impl Into<String>,
        build_hash: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
            build_hash: build_hash.into(),
        }
    }
}

impl From<&ModuleInfo> for ModuleKey {
    fn from(info: &ModuleInfo) -> Self {
        Self::new(&info.name, &info.version, &info.build_hash)
    }
}

/// Destination for gauge updates. Must tolerate calls from many sessions at once.
pub trait GaugeSink: Send + Sync {
    fn increment(&self, key: &ModuleKey);
    fn decrement(&self, key: &ModuleKey);
}

/// Concurrent gauge registry keyed by module identity.
#[derive(Debug, Default)]
pub struct GaugeRegistry {
    gauges: DashMap<ModuleKey, i64>,
}

impl GaugeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one gauge (0 if never touched).
    pub fn get(&self, key: &ModuleKey) -> i64 {
        self.gauges.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Sum over every gauge.
    pub fn total(&self) -> i64 {
        self.gauges.iter().map(|e| *e.value()).sum()
    }

    /// Number of module keys with a non-zero gauge.
    pub fn len(&self) -> usize {
        self.gauges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty()
    }

    /// All gauges, sorted by key.
    pub fn snapshot(&self) -> Vec<(ModuleKey, i64)> {
        let mut out: Vec<_> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort();
        out
    }

    /// Render the registry in Prometheus text format.
    ///
    /// Only keys with live instances are listed; a key disappears once its
    /// gauge drops back to zero.
    pub fn render_prometheus(&self, namespace: &str) -> String {
        let name = format!("{}_running_instances", namespace);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# HELP {} The number of running instances by module, version and build hash",
            name
        );
        let _ = writeln!(out, "# TYPE {} gauge", name);
        for (key, value) in self.snapshot() {
            let _ = writeln!(
                out,
                "{}{{module=\"{}\",version=\"{}\",build_hash=\"{}\"}} {}",
                name,
                escape_label(&key.module),
                escape_label(&key.version),
                escape_label(&key.build_hash),
                value
            );
        }
        out
    }
}

impl GaugeSink for GaugeRegistry {
    fn increment(&self, key: &ModuleKey) {
        if let Some(mut v) = self.gauges.get_mut(key) {
            *v += 1;
            return;
        }
        *self.gauges.entry(key.clone()).or_insert(0) += 1;
    }

    fn decrement(&self, key: &ModuleKey) {
        match self.gauges.get_mut(key) {
            Some(mut v) => *v -= 1,
            None => *self.gauges.entry(key.clone()).or_insert(0) -= 1,
        }
        // Client-chosen names must not accumulate series.
        self.gauges.remove_if(key, |_, v| *v == 0);
    }
}

/// Escape a label value per the text exposition format.
fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Increments held by one authenticated session.
///
/// Acquiring increments every key once; dropping decrements each of them
/// once. Holding the lease in an `Option` and taking it gives idempotent
/// cleanup on every exit path, including task abort and unwinding.
pub struct GaugeLease {
    sink: Arc<dyn GaugeSink>,
    keys: Vec<ModuleKey>,
}

impl GaugeLease {
    pub fn acquire(sink: Arc<dyn GaugeSink>, keys: Vec<ModuleKey>) -> Self {
        for key in &keys {
            sink.increment(key);
        }
        Self { sink, keys }
    }

    pub fn keys(&self) -> &[ModuleKey] {
        &self.keys
    }
}

impl Drop for GaugeLease {
    fn drop(&mut self) {
        for key in &self.keys {
            self.sink.decrement(key);
        }
    }
}

impl std::fmt::Debug for GaugeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeLease")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
