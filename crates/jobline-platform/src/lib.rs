//! Collaborator interfaces the client core reports to.
//!
//! The core never depends on a concrete observability backend. It records
//! breadcrumbs through [`DiagnosticsSink`] and ignores any failure to do so.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiagnosticsError {
    #[error("diagnostics sink unavailable: {0}")]
    Unavailable(String),
    #[error("diagnostics sink backend failure: {0}")]
    Backend(String),
}

/// Severity attached to a breadcrumb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreadcrumbLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A single diagnostic trail entry emitted around network activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// Unique id, useful for correlating a request breadcrumb with its failure.
    pub id: Uuid,
    /// Coarse grouping, for example `http` or `live`.
    pub category: String,
    pub level: BreadcrumbLevel,
    pub message: String,
    /// Ordered key/value annotations.
    pub data: Vec<(String, String)>,
}

impl Breadcrumb {
    pub fn new(
        category: impl Into<String>,
        level: BreadcrumbLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            level,
            message: message.into(),
            data: Vec::new(),
        }
    }

    /// Attach a key/value annotation.
    pub fn with_data(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.data.push((key.into(), value.to_string()));
        self
    }

    /// Look up the first annotation stored under `key`.
    pub fn data_value(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, crumb: &Breadcrumb) -> Result<(), DiagnosticsError>;
}

impl<S: DiagnosticsSink + ?Sized> DiagnosticsSink for Arc<S> {
    fn record(&self, crumb: &Breadcrumb) -> Result<(), DiagnosticsError> {
        (**self).record(crumb)
    }
}

/// Record a breadcrumb, swallowing sink failures.
///
/// Reporting must never affect the outcome of the operation being reported on.
pub fn record_best_effort(sink: &dyn DiagnosticsSink, crumb: Breadcrumb) {
    if let Err(err) = sink.record(&crumb) {
        tracing::debug!(error = %err, category = %crumb.category, "dropping diagnostics breadcrumb");
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl DiagnosticsSink for NoopDiagnostics {
    fn record(&self, _crumb: &Breadcrumb) -> Result<(), DiagnosticsError> {
        Ok(())
    }
}

/// Sink that forwards breadcrumbs to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn record(&self, crumb: &Breadcrumb) -> Result<(), DiagnosticsError> {
        let data = crumb
            .data
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        match crumb.level {
            BreadcrumbLevel::Debug => {
                tracing::debug!(id = %crumb.id, category = %crumb.category, %data, "{}", crumb.message)
            }
            BreadcrumbLevel::Info => {
                tracing::info!(id = %crumb.id, category = %crumb.category, %data, "{}", crumb.message)
            }
            BreadcrumbLevel::Warning => {
                tracing::warn!(id = %crumb.id, category = %crumb.category, %data, "{}", crumb.message)
            }
            BreadcrumbLevel::Error => {
                tracing::error!(id = %crumb.id, category = %crumb.category, %data, "{}", crumb.message)
            }
        }
        Ok(())
    }
}

/// Sink that keeps breadcrumbs in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct InMemoryDiagnostics {
    crumbs: Arc<RwLock<Vec<Breadcrumb>>>,
}

impl InMemoryDiagnostics {
    /// Snapshot of everything recorded so far, in recording order.
    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.crumbs
            .read()
            .map(|crumbs| crumbs.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut crumbs) = self.crumbs.write() {
            crumbs.clear();
        }
    }
}

impl DiagnosticsSink for InMemoryDiagnostics {
    fn record(&self, crumb: &Breadcrumb) -> Result<(), DiagnosticsError> {
        let mut crumbs = self
            .crumbs
            .write()
            .map_err(|_| DiagnosticsError::Backend("poisoned lock".to_owned()))?;
        crumbs.push(crumb.clone());
        Ok(())
    }
}

/// Wrapper that prefixes every breadcrumb category with a component name.
#[derive(Clone)]
pub struct ScopedDiagnostics<S: DiagnosticsSink> {
    inner: S,
    component: String,
}

impl<S: DiagnosticsSink> ScopedDiagnostics<S> {
    pub fn new(inner: S, component: impl Into<String>) -> Self {
        Self {
            inner,
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

impl<S: DiagnosticsSink> DiagnosticsSink for ScopedDiagnostics<S> {
    fn record(&self, crumb: &Breadcrumb) -> Result<(), DiagnosticsError> {
        let mut scoped = crumb.clone();
        scoped.category = format!("{}.{}", self.component, crumb.category);
        self.inner.record(&scoped)
    }
}
