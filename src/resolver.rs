use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fsutil::{sha256_hex, write_atomic};

pub const MODULE_EXTENSION: &str = "module";
pub const PATH_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub origin: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocation {
    pub name: String,
    pub origin: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no definition named '{0}' in any resolution source")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOrder {
    #[default]
    ChainFirst,
    OriginalFirst,
}

impl LookupOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChainFirst => "chain_first",
            Self::OriginalFirst => "original_first",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "chain_first" => Some(Self::ChainFirst),
            "original_first" => Some(Self::OriginalFirst),
            _ => None,
        }
    }
}

pub type ResourceIter<'a> = Box<dyn Iterator<Item = ResourceLocation> + 'a>;

pub trait ResolutionSource: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;

    fn find_definition(&self, name: &str) -> Result<Definition, LookupError>;

    fn find_resource(&self, name: &str) -> Option<ResourceLocation>;

    fn find_resources<'a>(&'a self, name: &'a str) -> ResourceIter<'a> {
        Box::new(self.find_resource(name).into_iter())
    }

    fn find_library(&self, name: &str) -> Option<PathBuf>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ModuleFile {
    #[serde(default)]
    definitions: BTreeMap<String, String>,
    #[serde(default)]
    resources: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModuleCache {
    source_sha256: String,
    #[serde(flatten)]
    module: ModuleFile,
}

#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub path: PathBuf,
    definitions: BTreeMap<String, Vec<u8>>,
    resources: BTreeMap<String, Vec<u8>>,
}

impl LoadedModule {
    pub fn load(path: &Path, cache_dir: Option<&Path>) -> Result<Self> {
        let raw =
            fs::read(path).with_context(|| format!("failed reading module {}", path.display()))?;
        let source_sha256 = sha256_hex(&raw);

        let cache_path = cache_dir.map(|dir| dir.join(cache_file_name(path)));
        if let Some(cached) = cache_path
            .as_deref()
            .and_then(|cache| read_cache(cache, &source_sha256))
        {
            debug!(module = %path.display(), "module cache hit");
            return Self::decode(path, cached);
        }

        let module: ModuleFile = serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing module {}", path.display()))?;
        let loaded = Self::decode(path, module)?;

        if let Some(cache) = cache_path {
            let payload = serde_json::to_vec(&ModuleCache {
                source_sha256,
                module: loaded.encode(),
            })
            .context("failed encoding module cache")?;
            write_atomic(&cache, &payload)
                .with_context(|| format!("failed writing module cache {}", cache.display()))?;
        }
        Ok(loaded)
    }

    fn decode(path: &Path, module: ModuleFile) -> Result<Self> {
        let decode_all = |entries: BTreeMap<String, String>| -> Result<BTreeMap<String, Vec<u8>>> {
            entries
                .into_iter()
                .map(|(name, encoded)| {
                    general_purpose::STANDARD
                        .decode(encoded.trim())
                        .map(|bytes| (name.clone(), bytes))
                        .map_err(|_| {
                            anyhow!("entry '{name}' in {} is not valid base64", path.display())
                        })
                })
                .collect()
        };
        Ok(Self {
            path: path.to_path_buf(),
            definitions: decode_all(module.definitions)?,
            resources: decode_all(module.resources)?,
        })
    }

    fn encode(&self) -> ModuleFile {
        let encode_all = |entries: &BTreeMap<String, Vec<u8>>| {
            entries
                .iter()
                .map(|(name, bytes)| (name.clone(), general_purpose::STANDARD.encode(bytes)))
                .collect()
        };
        ModuleFile {
            definitions: encode_all(&self.definitions),
            resources: encode_all(&self.resources),
        }
    }
}

fn cache_file_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("module");
    format!("{file_name}.cache")
}

fn read_cache(cache: &Path, source_sha256: &str) -> Option<ModuleFile> {
    let raw = fs::read(cache).ok()?;
    let parsed: ModuleCache = serde_json::from_slice(&raw).ok()?;
    (parsed.source_sha256 == source_sha256).then_some(parsed.module)
}

#[derive(Debug, Clone)]
pub struct ModuleResolver {
    label: String,
    modules: Vec<LoadedModule>,
    library_dirs: Vec<PathBuf>,
}

impl ModuleResolver {
    pub fn empty(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            modules: Vec::new(),
            library_dirs: Vec::new(),
        }
    }

    pub fn from_modules(
        label: impl Into<String>,
        paths: &[PathBuf],
        cache_dir: Option<&Path>,
    ) -> Result<Self> {
        let modules = paths
            .iter()
            .map(|path| LoadedModule::load(path, cache_dir))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            label: label.into(),
            modules,
            library_dirs: Vec::new(),
        })
    }

    /// Loads every `*.module` file directly under `dir` in file-name order.
    /// A missing directory yields an empty resolver.
    pub fn open_dir(label: impl Into<String>, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Ok(Self::empty(label));
        }
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("failed listing modules in {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(MODULE_EXTENSION)
            })
            .collect::<Vec<_>>();
        paths.sort();
        Self::from_modules(label, &paths, None)
    }

    pub fn with_library_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.library_dirs = dirs;
        self
    }

    pub fn module_paths(&self) -> Vec<PathBuf> {
        self.modules.iter().map(|module| module.path.clone()).collect()
    }

    pub fn library_dirs(&self) -> &[PathBuf] {
        &self.library_dirs
    }
}

impl ResolutionSource for ModuleResolver {
    fn label(&self) -> &str {
        &self.label
    }

    fn find_definition(&self, name: &str) -> Result<Definition, LookupError> {
        self.modules
            .iter()
            .find_map(|module| module.definitions.get(name))
            .map(|payload| Definition {
                name: name.to_string(),
                origin: self.label.clone(),
                payload: payload.clone(),
            })
            .ok_or_else(|| LookupError::NotFound(name.to_string()))
    }

    fn find_resource(&self, name: &str) -> Option<ResourceLocation> {
        self.find_resources(name).next()
    }

    fn find_resources<'a>(&'a self, name: &'a str) -> ResourceIter<'a> {
        Box::new(self.modules.iter().filter_map(move |module| {
            module.resources.get(name).map(|payload| ResourceLocation {
                name: name.to_string(),
                origin: self.label.clone(),
                payload: payload.clone(),
            })
        }))
    }

    fn find_library(&self, name: &str) -> Option<PathBuf> {
        find_library_in(self.library_dirs.iter().map(PathBuf::as_path), name)
    }
}

pub fn map_library_name(name: &str) -> String {
    if name.ends_with(".so") {
        name.to_string()
    } else {
        format!("lib{name}.so")
    }
}

fn find_library_in<'a>(dirs: impl IntoIterator<Item = &'a Path>, name: &str) -> Option<PathBuf> {
    let file_name = map_library_name(name);
    dirs.into_iter()
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainMode {
    Layered(LookupOrder),
    DelegateLast,
}

#[derive(Debug)]
pub struct ResolutionChain {
    mode: ChainMode,
    plugin: Option<Arc<dyn ResolutionSource>>,
    system: Arc<dyn ResolutionSource>,
    patched: ModuleResolver,
    parent: Arc<dyn ResolutionSource>,
    module_path: String,
    library_path: String,
}

impl ResolutionChain {
    pub fn layered(
        order: LookupOrder,
        plugin: Option<Arc<dyn ResolutionSource>>,
        system: Arc<dyn ResolutionSource>,
        patched: ModuleResolver,
        original: Arc<dyn ResolutionSource>,
    ) -> Self {
        Self::assemble(ChainMode::Layered(order), plugin, system, patched, original)
    }

    pub fn delegate_last(
        system: Arc<dyn ResolutionSource>,
        patched: ModuleResolver,
        parent: Arc<dyn ResolutionSource>,
    ) -> Self {
        Self::assemble(ChainMode::DelegateLast, None, system, patched, parent)
    }

    fn assemble(
        mode: ChainMode,
        plugin: Option<Arc<dyn ResolutionSource>>,
        system: Arc<dyn ResolutionSource>,
        patched: ModuleResolver,
        parent: Arc<dyn ResolutionSource>,
    ) -> Self {
        let module_path = join_paths(patched.module_paths().iter().map(PathBuf::as_path));
        Self {
            mode,
            plugin,
            system,
            patched,
            parent,
            module_path,
            library_path: String::new(),
        }
    }

    pub fn with_library_path(mut self, library_path: String) -> Self {
        self.library_path = library_path;
        self
    }

    /// Swaps the fallback resolver. Only valid before the chain is shared.
    pub(crate) fn reparent(&mut self, parent: Arc<dyn ResolutionSource>) {
        self.parent = parent;
    }

    pub fn parent_label(&self) -> &str {
        self.parent.label()
    }

    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    pub fn library_path(&self) -> &str {
        &self.library_path
    }

    pub fn patched(&self) -> &ModuleResolver {
        &self.patched
    }

    pub fn lookup_order(&self) -> Option<LookupOrder> {
        match self.mode {
            ChainMode::Layered(order) => Some(order),
            ChainMode::DelegateLast => None,
        }
    }

    fn definition_sources(&self) -> Vec<&dyn ResolutionSource> {
        let mut sources: Vec<&dyn ResolutionSource> = Vec::with_capacity(4);
        match self.mode {
            ChainMode::Layered(order) => {
                if let Some(plugin) = &self.plugin {
                    sources.push(plugin.as_ref());
                }
                if order == LookupOrder::OriginalFirst {
                    sources.push(self.parent.as_ref());
                }
                sources.push(&self.patched);
                sources.push(self.system.as_ref());
                if order == LookupOrder::ChainFirst {
                    sources.push(self.parent.as_ref());
                }
            }
            ChainMode::DelegateLast => {
                sources.push(self.system.as_ref());
                sources.push(&self.patched);
                sources.push(self.parent.as_ref());
            }
        }
        sources
    }

    fn resource_sources(&self) -> [&dyn ResolutionSource; 3] {
        [self.system.as_ref(), &self.patched, self.parent.as_ref()]
    }
}

impl ResolutionSource for ResolutionChain {
    fn label(&self) -> &str {
        "patch-chain"
    }

    fn find_definition(&self, name: &str) -> Result<Definition, LookupError> {
        self.definition_sources()
            .into_iter()
            .find_map(|source| source.find_definition(name).ok())
            .ok_or_else(|| LookupError::NotFound(name.to_string()))
    }

    fn find_resource(&self, name: &str) -> Option<ResourceLocation> {
        self.resource_sources()
            .into_iter()
            .find_map(|source| source.find_resource(name))
    }

    fn find_resources<'a>(&'a self, name: &'a str) -> ResourceIter<'a> {
        Box::new(
            self.resource_sources()
                .into_iter()
                .flat_map(move |source| source.find_resources(name)),
        )
    }

    fn find_library(&self, name: &str) -> Option<PathBuf> {
        find_library_in(
            self.patched
                .library_dirs()
                .iter()
                .map(PathBuf::as_path)
                .chain(split_paths(&self.library_path)),
            name,
        )
        .or_else(|| self.parent.find_library(name))
    }
}

pub fn join_paths<'a>(paths: impl IntoIterator<Item = &'a Path>) -> String {
    paths
        .into_iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(&PATH_SEPARATOR.to_string())
}

fn split_paths(joined: &str) -> impl Iterator<Item = &Path> {
    joined
        .split(PATH_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(Path::new)
}
