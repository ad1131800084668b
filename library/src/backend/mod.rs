//! Backends: external native calculation libraries exposing versioned function groups.

mod loader;
mod registry;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use libloading::Library;

use crate::error::BackendError;
use crate::model::Value;
use crate::node::NodeFailure;

pub use registry::{BackendBinding, BackendRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl From<(u32, u32, u32)> for Version {
    fn from((major, minor, patch): (u32, u32, u32)) -> Self {
        Self::new(major, minor, patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = BackendError;

    /// Accepts `1`, `1.2` and `1.2.3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 3];
        let pieces: Vec<&str> = s.trim().split('.').collect();
        if pieces.is_empty() || pieces.len() > 3 {
            return Err(BackendError::InvalidVersion(s.to_string()));
        }
        for (slot, piece) in parts.iter_mut().zip(&pieces) {
            *slot = piece
                .parse()
                .map_err(|_| BackendError::InvalidVersion(s.to_string()))?;
        }
        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

/// Accepted backend versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionReq {
    #[default]
    Any,
    Exact(Version),
    /// `>= v` within the same major version.
    Compatible(Version),
    /// Half-open range `[min, max)`.
    Range { min: Version, max: Version },
}

impl VersionReq {
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionReq::Any => true,
            VersionReq::Exact(v) => v == version,
            VersionReq::Compatible(v) => version.major == v.major && version >= v,
            VersionReq::Range { min, max } => version >= min && version < max,
        }
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionReq::Any => write!(f, "*"),
            VersionReq::Exact(v) => write!(f, "={}", v),
            VersionReq::Compatible(v) => write!(f, "^{}", v),
            VersionReq::Range { min, max } => write!(f, ">={}, <{}", min, max),
        }
    }
}

/// A single callable exposed by a backend.
pub trait BackendFunction: Send + Sync {
    fn call(&self, args: &[Value]) -> Result<Value, NodeFailure>;
}

impl<F> BackendFunction for F
where
    F: Fn(&[Value]) -> Result<Value, NodeFailure> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> Result<Value, NodeFailure> {
        self(args)
    }
}

/// One entry of a backend's function table.
#[derive(Clone)]
pub struct BackendFunctionEntry {
    pub group: String,
    pub type_name: String,
    pub function: Arc<dyn BackendFunction>,
}

impl BackendFunctionEntry {
    pub fn new<F>(group: impl Into<String>, type_name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, NodeFailure> + Send + Sync + 'static,
    {
        Self::from_arc(group, type_name, Arc::new(function))
    }

    pub fn from_arc(
        group: impl Into<String>,
        type_name: impl Into<String>,
        function: Arc<dyn BackendFunction>,
    ) -> Self {
        Self {
            group: group.into(),
            type_name: type_name.into(),
            function,
        }
    }
}

/// Plugin trait implemented by dynamically loaded backends.
pub trait BackendPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> (u32, u32, u32);
    fn thread_safe(&self) -> bool {
        false
    }
    fn functions(&self) -> Vec<BackendFunctionEntry>;
}

pub type BackendPluginCreateFn = unsafe extern "C" fn() -> *mut dyn BackendPlugin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    Absent(String),
    Broken(String),
}

impl LoadStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadStatus::Loaded)
    }
}

/// A discovered backend and its function table.
pub struct Backend {
    name: String,
    version: Version,
    status: LoadStatus,
    thread_safe: bool,
    functions: HashMap<String, BackendFunctionEntry>,
    /// Serialises calls into backends that are not reentrant.
    call_lock: Mutex<()>,
    // Must be dropped after `functions`, which may point into the library.
    _library: Option<Arc<Library>>,
}

impl Backend {
    pub fn new(name: impl Into<String>, version: impl Into<Version>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            status: LoadStatus::Loaded,
            thread_safe: false,
            functions: HashMap::new(),
            call_lock: Mutex::new(()),
            _library: None,
        }
    }

    /// A backend that was expected but could not be found.
    pub fn absent(
        name: impl Into<String>,
        version: impl Into<Version>,
        reason: impl Into<String>,
    ) -> Self {
        let mut backend = Self::new(name, version);
        backend.status = LoadStatus::Absent(reason.into());
        backend
    }

    /// A backend that was found but failed to load.
    pub fn broken(
        name: impl Into<String>,
        version: impl Into<Version>,
        reason: impl Into<String>,
    ) -> Self {
        let mut backend = Self::new(name, version);
        backend.status = LoadStatus::Broken(reason.into());
        backend
    }

    pub fn from_plugin(plugin: &dyn BackendPlugin) -> Self {
        let mut backend = Self::new(plugin.name(), plugin.version());
        backend.thread_safe = plugin.thread_safe();
        for entry in plugin.functions() {
            backend.functions.insert(entry.group.clone(), entry);
        }
        backend
    }

    pub fn with_function(mut self, entry: BackendFunctionEntry) -> Self {
        self.functions.insert(entry.group.clone(), entry);
        self
    }

    pub fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    pub(crate) fn attach_library(&mut self, library: Arc<Library>) {
        self._library = Some(library);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    pub fn function(&self, group: &str) -> Option<&BackendFunctionEntry> {
        self.functions.get(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// `name@version`.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("status", &self.status)
            .field("thread_safe", &self.thread_safe)
            .field("groups", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A node's need for a backend function group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequirement {
    pub group: String,
    pub type_name: Option<String>,
    pub backend: Option<String>,
    pub versions: VersionReq,
}

impl BackendRequirement {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            type_name: None,
            backend: None,
            versions: VersionReq::Any,
        }
    }

    pub fn of_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Restricts the requirement to one backend and version range.
    pub fn from_backend(mut self, backend: impl Into<String>, versions: VersionReq) -> Self {
        self.backend = Some(backend.into());
        self.versions = versions;
        self
    }

    pub(crate) fn accepts(&self, backend: &Backend) -> bool {
        if let Some(name) = &self.backend {
            if name != backend.name() {
                return false;
            }
        }
        if !self.versions.matches(&backend.version()) {
            return false;
        }
        match backend.function(&self.group) {
            Some(entry) => self
                .type_name
                .as_ref()
                .map_or(true, |t| *t == entry.type_name),
            None => false,
        }
    }
}
