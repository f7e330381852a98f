use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::host::HostRuntime;
use crate::resolver::ResolutionSource;

pub const DEFINING_CONTEXT_LEVEL_LIMIT: u32 = 26;
pub const RESOURCE_BINDING_LEVEL_LIMIT: u32 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    ThreadResolver,
    ProcessContext,
    OwningPackage,
    DefiningContext,
    ResourceTable,
    InflationHelper,
}

impl BindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThreadResolver => "thread_resolver",
            Self::ProcessContext => "process_context",
            Self::OwningPackage => "owning_package",
            Self::DefiningContext => "defining_context",
            Self::ResourceTable => "resource_table",
            Self::InflationHelper => "inflation_helper",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Required,
    TolerateUnsupported,
    Wrapped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("binding point is not supported by this host")]
    Unsupported,
    #[error("binding failed: {0}")]
    Failed(String),
}

type Setter = fn(&dyn HostRuntime, Arc<dyn ResolutionSource>) -> Result<(), BindingError>;

#[derive(Clone, Copy)]
pub struct BindingPoint {
    pub kind: BindingKind,
    pub mode: FailureMode,
    setter: Setter,
}

impl BindingPoint {
    fn new(kind: BindingKind, mode: FailureMode, setter: Setter) -> Self {
        Self { kind, mode, setter }
    }
}

impl std::fmt::Debug for BindingPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingPoint")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .finish()
    }
}

pub fn binding_table(capability_level: u32) -> Vec<BindingPoint> {
    let mut table = vec![
        BindingPoint::new(BindingKind::ThreadResolver, FailureMode::Required, |host, chain| {
            host.bind_thread_resolver(chain)
        }),
        BindingPoint::new(
            BindingKind::ProcessContext,
            FailureMode::TolerateUnsupported,
            |host, chain| host.bind_process_context(chain),
        ),
        BindingPoint::new(BindingKind::OwningPackage, FailureMode::Required, |host, chain| {
            host.bind_owning_package(chain)
        }),
    ];
    if capability_level < DEFINING_CONTEXT_LEVEL_LIMIT {
        table.push(BindingPoint::new(
            BindingKind::DefiningContext,
            FailureMode::Required,
            |host, chain| host.bind_defining_context(chain),
        ));
    }
    if capability_level < RESOURCE_BINDING_LEVEL_LIMIT {
        table.push(BindingPoint::new(
            BindingKind::ResourceTable,
            FailureMode::Wrapped,
            |host, chain| host.bind_resource_table(chain),
        ));
        table.push(BindingPoint::new(
            BindingKind::InflationHelper,
            FailureMode::Wrapped,
            |host, chain| host.bind_inflation_helper(chain),
        ));
    }
    table
}

pub fn retarget_all(
    host: &dyn HostRuntime,
    chain: Arc<dyn ResolutionSource>,
) -> Result<Vec<BindingKind>, (BindingKind, BindingError)> {
    let mut bound = Vec::new();
    for point in binding_table(host.capability_level()) {
        match ((point.setter)(host, Arc::clone(&chain)), point.mode) {
            (Ok(()), _) => bound.push(point.kind),
            (Err(BindingError::Unsupported), FailureMode::TolerateUnsupported) => {
                debug!(binding = point.kind.as_str(), "binding unsupported by host, skipped");
            }
            (Err(err), FailureMode::Wrapped) => {
                warn!(binding = point.kind.as_str(), error = %err, "optional binding failed");
            }
            (Err(err), _) => return Err((point.kind, err)),
        }
    }
    Ok(bound)
}
