//! Dynamic loading of backend plugins.

use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};

use super::{Backend, BackendPlugin, BackendPluginCreateFn, BackendRegistry, Version};
use crate::error::LibraryError;

const CREATE_SYMBOL: &[u8] = b"create_backend_plugin";

impl BackendRegistry {
    unsafe fn load_plugin(path: &Path) -> Result<Backend, LibraryError> {
        let library = Arc::new(unsafe { Library::new(path)? });
        let constructor: Symbol<BackendPluginCreateFn> =
            unsafe { library.get(CREATE_SYMBOL)? };
        let raw = unsafe { constructor() };
        if raw.is_null() {
            return Err(LibraryError::Plugin(format!(
                "Plugin constructor {} returned null",
                String::from_utf8_lossy(CREATE_SYMBOL)
            )));
        }
        let plugin: Box<dyn BackendPlugin> = unsafe { Box::from_raw(raw) };
        let mut backend = Backend::from_plugin(plugin.as_ref());
        // The plugin object's code lives in the library too.
        drop(plugin);
        backend.attach_library(library);
        Ok(backend)
    }

    /// Loads a backend plugin from a dynamic library.
    ///
    /// A library that fails to load is recorded once as broken, under its file stem, so nodes
    /// requiring it are excluded from graph building instead of failing later.
    pub fn load_plugin_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), LibraryError> {
        let path = path.as_ref();
        match unsafe { Self::load_plugin(path) } {
            Ok(backend) => {
                log::info!("Loaded backend plugin {} from {}", backend.label(), path.display());
                self.register(backend);
                Ok(())
            }
            Err(e) => {
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.trim_start_matches("lib").to_string())
                    .unwrap_or_else(|| path.display().to_string());
                self.register(Backend::broken(name, Version::new(0, 0, 0), e.to_string()));
                Err(e)
            }
        }
    }

    /// Loads every `.so`/`.dll`/`.dylib` in `dir_path`. Failures are recorded, not returned.
    pub fn load_plugins_from_directory<P: AsRef<Path>>(
        &mut self,
        dir_path: P,
    ) -> Result<(), LibraryError> {
        let dir = dir_path.as_ref();
        if !dir.is_dir() {
            log::warn!("Backend plugin directory not found: {}", dir.display());
            return Ok(());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let extension = path.extension().and_then(|s| s.to_str());
            if path.is_file() && matches!(extension, Some("so") | Some("dll") | Some("dylib")) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            log::info!("Attempting to load backend plugin from: {}", path.display());
            if let Err(e) = self.load_plugin_from_file(&path) {
                log::warn!("Not a backend plugin: {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoadStatus;

    #[test]
    fn missing_library_is_recorded_as_broken() {
        let mut registry = BackendRegistry::new();
        let result = registry.load_plugin_from_file("/nonexistent/libFeynHiggs.so");
        assert!(result.is_err());
        let backend = registry.iter().next().unwrap();
        assert_eq!(backend.name(), "FeynHiggs");
        assert!(matches!(backend.status(), LoadStatus::Broken(_)));
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let mut registry = BackendRegistry::new();
        registry
            .load_plugins_from_directory("/nonexistent/backends")
            .unwrap();
        assert!(registry.is_empty());
    }
}
