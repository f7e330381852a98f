use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::bindings::{BindingError, BindingKind};
use crate::resolver::{ModuleResolver, ResolutionSource};

pub trait HostRuntime: Send + Sync {
    fn capability_level(&self) -> u32;

    fn platform_fingerprint(&self) -> String;

    fn original_resolver(&self) -> Arc<dyn ResolutionSource>;

    fn system_resolver(&self) -> Arc<dyn ResolutionSource>;

    fn plugin_resolver(&self) -> Option<Arc<dyn ResolutionSource>>;

    fn original_library_dirs(&self) -> Vec<Option<PathBuf>>;

    fn alt_runtime_active(&self) -> bool;

    fn bind_thread_resolver(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError>;

    fn bind_process_context(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError>;

    fn bind_owning_package(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError>;

    fn bind_defining_context(&self, chain: Arc<dyn ResolutionSource>)
        -> Result<(), BindingError>;

    fn bind_resource_table(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError>;

    fn bind_inflation_helper(&self, chain: Arc<dyn ResolutionSource>)
        -> Result<(), BindingError>;

    fn install_native_dirs(&self, dirs: &[PathBuf]) -> Result<()>;

    fn load_alt_runtime(&self, modules: &[PathBuf]) -> Result<()>;

    fn install_resources(&self, archives: &[PathBuf]) -> Result<()>;
}

#[derive(Default)]
struct HostSlots {
    bound: HashMap<BindingKind, Arc<dyn ResolutionSource>>,
    native_dirs: Vec<PathBuf>,
    alt_runtime_modules: Vec<PathBuf>,
    resource_archives: Vec<PathBuf>,
}

pub struct StandaloneHost {
    capability_level: u32,
    platform_fingerprint: String,
    original: Arc<dyn ResolutionSource>,
    system: Arc<dyn ResolutionSource>,
    plugin: Option<Arc<dyn ResolutionSource>>,
    original_library_dirs: Vec<Option<PathBuf>>,
    alt_runtime_active: bool,
    binding_failures: HashMap<BindingKind, BindingError>,
    fail_resources: bool,
    slots: RwLock<HostSlots>,
}

impl StandaloneHost {
    pub fn new(
        capability_level: u32,
        platform_fingerprint: impl Into<String>,
        original: Arc<dyn ResolutionSource>,
        system: Arc<dyn ResolutionSource>,
    ) -> Self {
        Self {
            capability_level,
            platform_fingerprint: platform_fingerprint.into(),
            original,
            system,
            plugin: None,
            original_library_dirs: Vec::new(),
            alt_runtime_active: false,
            binding_failures: HashMap::new(),
            fail_resources: false,
            slots: RwLock::new(HostSlots::default()),
        }
    }

    pub fn open(
        app_dir: &Path,
        capability_level: u32,
        platform_fingerprint: impl Into<String>,
    ) -> Result<Self> {
        let lib_dir = app_dir.join("lib");
        let original = ModuleResolver::open_dir("original", &app_dir.join("code"))
            .context("failed loading original modules")?
            .with_library_dirs(vec![lib_dir.clone()]);
        let system = ModuleResolver::open_dir("system", &app_dir.join("system"))
            .context("failed loading system modules")?;
        let plugin_dir = app_dir.join("plugin");
        let plugin = if plugin_dir.is_dir() {
            let resolver = ModuleResolver::open_dir("plugin", &plugin_dir)
                .context("failed loading plugin modules")?;
            Some(Arc::new(resolver) as Arc<dyn ResolutionSource>)
        } else {
            None
        };

        let mut host = Self::new(
            capability_level,
            platform_fingerprint,
            Arc::new(original),
            Arc::new(system),
        )
        .with_original_library_dirs(vec![lib_dir.is_dir().then_some(lib_dir)]);
        host.plugin = plugin;
        Ok(host)
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn ResolutionSource>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    pub fn with_original_library_dirs(mut self, dirs: Vec<Option<PathBuf>>) -> Self {
        self.original_library_dirs = dirs;
        self
    }

    pub fn with_alt_runtime_active(mut self, active: bool) -> Self {
        self.alt_runtime_active = active;
        self
    }

    pub fn with_binding_failure(mut self, kind: BindingKind, err: BindingError) -> Self {
        self.binding_failures.insert(kind, err);
        self
    }

    pub fn with_failing_resources(mut self) -> Self {
        self.fail_resources = true;
        self
    }

    pub fn current_resolver(&self) -> Option<Arc<dyn ResolutionSource>> {
        self.bound(BindingKind::ThreadResolver)
    }

    pub fn bound(&self, kind: BindingKind) -> Option<Arc<dyn ResolutionSource>> {
        self.read_slots().bound.get(&kind).cloned()
    }

    pub fn native_dirs(&self) -> Vec<PathBuf> {
        self.read_slots().native_dirs.clone()
    }

    pub fn alt_runtime_modules(&self) -> Vec<PathBuf> {
        self.read_slots().alt_runtime_modules.clone()
    }

    pub fn resource_archives(&self) -> Vec<PathBuf> {
        self.read_slots().resource_archives.clone()
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, HostSlots> {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, HostSlots> {
        self.slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, kind: BindingKind, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError> {
        if let Some(err) = self.binding_failures.get(&kind) {
            return Err(err.clone());
        }
        self.write_slots().bound.insert(kind, chain);
        debug!(binding = kind.as_str(), "binding retargeted");
        Ok(())
    }
}

impl HostRuntime for StandaloneHost {
    fn capability_level(&self) -> u32 {
        self.capability_level
    }

    fn platform_fingerprint(&self) -> String {
        self.platform_fingerprint.clone()
    }

    fn original_resolver(&self) -> Arc<dyn ResolutionSource> {
        Arc::clone(&self.original)
    }

    fn system_resolver(&self) -> Arc<dyn ResolutionSource> {
        Arc::clone(&self.system)
    }

    fn plugin_resolver(&self) -> Option<Arc<dyn ResolutionSource>> {
        self.plugin.clone()
    }

    fn original_library_dirs(&self) -> Vec<Option<PathBuf>> {
        self.original_library_dirs.clone()
    }

    fn alt_runtime_active(&self) -> bool {
        self.alt_runtime_active
    }

    fn bind_thread_resolver(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError> {
        self.bind(BindingKind::ThreadResolver, chain)
    }

    fn bind_process_context(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError> {
        self.bind(BindingKind::ProcessContext, chain)
    }

    fn bind_owning_package(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError> {
        self.bind(BindingKind::OwningPackage, chain)
    }

    fn bind_defining_context(
        &self,
        chain: Arc<dyn ResolutionSource>,
    ) -> Result<(), BindingError> {
        self.bind(BindingKind::DefiningContext, chain)
    }

    fn bind_resource_table(&self, chain: Arc<dyn ResolutionSource>) -> Result<(), BindingError> {
        self.bind(BindingKind::ResourceTable, chain)
    }

    fn bind_inflation_helper(
        &self,
        chain: Arc<dyn ResolutionSource>,
    ) -> Result<(), BindingError> {
        self.bind(BindingKind::InflationHelper, chain)
    }

    fn install_native_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        self.write_slots().native_dirs = dirs.to_vec();
        info!(count = dirs.len(), "patched native library directories installed");
        Ok(())
    }

    fn load_alt_runtime(&self, modules: &[PathBuf]) -> Result<()> {
        for module in modules {
            ModuleResolver::from_modules("alt-runtime", std::slice::from_ref(module), None)
                .with_context(|| format!("failed loading alt runtime module {}", module.display()))?;
        }
        self.write_slots().alt_runtime_modules = modules.to_vec();
        info!(count = modules.len(), "alternate runtime modules loaded");
        Ok(())
    }

    fn install_resources(&self, archives: &[PathBuf]) -> Result<()> {
        if self.fail_resources {
            return Err(anyhow!("resource table rejected patched archives"));
        }
        self.write_slots().resource_archives = archives.to_vec();
        info!(count = archives.len(), "patched resource archives installed");
        Ok(())
    }
}
