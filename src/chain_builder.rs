use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::resolver::{LookupOrder, ModuleResolver, ResolutionChain, ResolutionSource, PATH_SEPARATOR};

pub const NATIVE_DELEGATE_LAST_LEVEL: u32 = 31;
pub const REWIRED_DELEGATE_LAST_LEVEL: u32 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    DelegateLast,
    DelegateLastRewired,
    Custom,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DelegateLast => "delegate_last",
            Self::DelegateLastRewired => "delegate_last_rewired",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainInputs {
    pub original: Arc<dyn ResolutionSource>,
    pub system: Arc<dyn ResolutionSource>,
    pub plugin: Option<Arc<dyn ResolutionSource>>,
    pub module_paths: Vec<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub patched_library_dirs: Vec<PathBuf>,
    pub original_library_dirs: Vec<Option<PathBuf>>,
    pub lookup_order: LookupOrder,
}

impl ChainInputs {
    fn patched_resolver(&self) -> Result<ModuleResolver> {
        let resolver =
            ModuleResolver::from_modules("patched", &self.module_paths, self.cache_dir.as_deref())
                .context("failed loading patched code modules")?;
        Ok(resolver.with_library_dirs(self.patched_library_dirs.clone()))
    }
}

pub trait ChainStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn build(&self, inputs: &ChainInputs) -> Result<ResolutionChain>;
}

struct DelegateLastStrategy;

impl ChainStrategy for DelegateLastStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DelegateLast
    }

    fn build(&self, inputs: &ChainInputs) -> Result<ResolutionChain> {
        Ok(ResolutionChain::delegate_last(
            Arc::clone(&inputs.system),
            inputs.patched_resolver()?,
            Arc::clone(&inputs.original),
        ))
    }
}

struct RewiredDelegateLastStrategy;

impl ChainStrategy for RewiredDelegateLastStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DelegateLastRewired
    }

    fn build(&self, inputs: &ChainInputs) -> Result<ResolutionChain> {
        let mut chain = ResolutionChain::delegate_last(
            Arc::clone(&inputs.system),
            inputs.patched_resolver()?,
            Arc::clone(&inputs.system),
        );
        chain.reparent(Arc::clone(&inputs.original));
        debug!(parent = chain.parent_label(), "delegate-last chain re-parented");
        Ok(chain)
    }
}

struct CustomChainStrategy;

impl ChainStrategy for CustomChainStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Custom
    }

    fn build(&self, inputs: &ChainInputs) -> Result<ResolutionChain> {
        Ok(ResolutionChain::layered(
            inputs.lookup_order,
            inputs.plugin.clone(),
            Arc::clone(&inputs.system),
            inputs.patched_resolver()?,
            Arc::clone(&inputs.original),
        ))
    }
}

pub fn select_strategy(capability_level: u32, use_delegate_last: bool) -> Box<dyn ChainStrategy> {
    if use_delegate_last && capability_level >= NATIVE_DELEGATE_LAST_LEVEL {
        Box::new(DelegateLastStrategy)
    } else if use_delegate_last && capability_level >= REWIRED_DELEGATE_LAST_LEVEL {
        Box::new(RewiredDelegateLastStrategy)
    } else {
        Box::new(CustomChainStrategy)
    }
}

pub fn combine_library_path(dirs: &[Option<PathBuf>]) -> String {
    dirs.iter()
        .flatten()
        .map(|dir| dir.display().to_string())
        .collect::<Vec<_>>()
        .join(&PATH_SEPARATOR.to_string())
}

pub fn build_chain(
    strategy: &dyn ChainStrategy,
    inputs: &ChainInputs,
) -> Result<Arc<ResolutionChain>> {
    let library_path = combine_library_path(&inputs.original_library_dirs);
    let chain = strategy.build(inputs)?.with_library_path(library_path);
    info!(
        strategy = strategy.kind().as_str(),
        modules = inputs.module_paths.len(),
        module_path = chain.module_path(),
        library_path = chain.library_path(),
        "resolution chain built"
    );
    Ok(Arc::new(chain))
}
