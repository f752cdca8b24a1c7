// Copyright 2025 FusionFlow Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The process-wide node registry.
//!
//! Maps class names to constructor functions so pipelines can be built
//! from a textual topology description. Node libraries either register
//! in-process (via [`enable_dynamic_loading!`] + [`export_plugin!`] and a
//! direct call) or are discovered as shared libraries under the directory
//! named by the `FUSIONFLOW_NODE_DIR` environment variable.
//!
//! Dynamically loaded plugins must be built with the same toolchain as the
//! host: the registration entry point passes `Arc<dyn Node>` values across
//! the library boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use fusionflow_common::error::{FlowError, FlowResult};
use parking_lot::Mutex;

use crate::node::Node;

/// Environment variable pointing at the plugin directory scanned by
/// [`NodeRegistry::init`].
pub const NODE_DIR_ENV: &str = "FUSIONFLOW_NODE_DIR";

/// Symbol every plugin library exports; generated by [`export_plugin!`].
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"fusionflow_plugin_register";

/// Constructor registered per node class: thread count in, node out.
pub type NodeCtor = Arc<dyn Fn(usize) -> FlowResult<Arc<dyn Node>> + Send + Sync>;

/// Signature of the plugin registration entry point.
pub type PluginRegisterFn = unsafe extern "C" fn(&NodeRegistry);

/// Process-wide class-name -> constructor map.
pub struct NodeRegistry {
    classes: Mutex<HashMap<String, NodeCtor>>,
    libraries: Mutex<Vec<(PathBuf, libloading::Library)>>,
}

static GLOBAL: LazyLock<NodeRegistry> = LazyLock::new(NodeRegistry::new);

impl NodeRegistry {
    fn new() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// The singleton registry shared by the whole process.
    pub fn global() -> &'static NodeRegistry {
        &GLOBAL
    }

    /// Register a constructor under `class`, replacing any previous one.
    pub fn register_ctor(
        &self,
        class: &str,
        ctor: impl Fn(usize) -> FlowResult<Arc<dyn Node>> + Send + Sync + 'static,
    ) {
        self.classes.lock().insert(class.to_owned(), Arc::new(ctor));
    }

    /// Remove `class`; it is no longer instantiable afterwards.
    pub fn unregister_ctor(&self, class: &str) {
        self.classes.lock().remove(class);
    }

    pub fn is_registered(&self, class: &str) -> bool {
        self.classes.lock().contains_key(class)
    }

    pub fn registered_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.classes.lock().keys().cloned().collect();
        classes.sort_unstable();
        classes
    }

    /// Construct a node of `class` with the given worker thread count.
    pub fn instantiate(&self, class: &str, thread_num: usize) -> FlowResult<Arc<dyn Node>> {
        let ctor = self
            .classes
            .lock()
            .get(class)
            .cloned()
            .ok_or_else(|| FlowError::UnknownClass(class.into()))?;
        ctor(thread_num)
    }

    /// Load one shared library, or recursively scan a directory for
    /// loadable libraries, invoking each library's registration entry
    /// point. Loaded libraries stay open for the life of the registry.
    pub fn load(&self, path: impl AsRef<Path>) -> FlowResult<()> {
        let path = path.as_ref();
        if path.is_dir() {
            for lib in discover_libraries(path)? {
                self.load_library(&lib)?;
            }
            Ok(())
        } else {
            self.load_library(path)
        }
    }

    fn load_library(&self, path: &Path) -> FlowResult<()> {
        // SAFETY: plugin libraries are trusted code installed by the
        // operator; the entry point contract is defined by export_plugin!.
        unsafe {
            let lib = libloading::Library::new(path).map_err(|e| {
                FlowError::failure(format!("failed to open {}: {e}", path.display()))
            })?;
            let entry: libloading::Symbol<'_, PluginRegisterFn> =
                lib.get(PLUGIN_ENTRY_SYMBOL).map_err(|e| {
                    FlowError::failure(format!(
                        "{} exports no plugin entry point: {e}",
                        path.display()
                    ))
                })?;
            entry(self);
            drop(entry);
            self.libraries.lock().push((path.to_owned(), lib));
        }
        tracing::info!(library = %path.display(), "loaded node library");
        Ok(())
    }

    /// Close a library previously opened by [`NodeRegistry::load`]. Classes
    /// it registered must be unregistered by the caller first.
    pub fn unload(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.libraries.lock().retain(|(p, _)| p != path);
    }

    /// Scan the directory named by `FUSIONFLOW_NODE_DIR`, when set.
    pub fn init(&self) -> FlowResult<()> {
        match std::env::var(NODE_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => self.load(dir),
            _ => {
                tracing::debug!("{NODE_DIR_ENV} not set, skipping plugin discovery");
                Ok(())
            }
        }
    }
}

fn discover_libraries(dir: &Path) -> FlowResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| FlowError::failure(format!("cannot scan {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| FlowError::failure(format!("cannot scan {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.is_dir() {
            found.extend(discover_libraries(&path)?);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("so" | "dylib" | "dll")
        ) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Reconstruct the node handed out by a generated `<ClassName>_create`
/// entry point.
///
/// # Safety
///
/// `ptr` must come from a `<ClassName>_create` call in a library built
/// with the same toolchain, and must not be used again afterwards.
pub unsafe fn node_from_raw(ptr: *mut std::ffi::c_void) -> Option<Arc<dyn Node>> {
    if ptr.is_null() {
        return None;
    }
    Some(*Box::from_raw(ptr as *mut Arc<dyn Node>))
}

#[doc(hidden)]
pub mod __private {
    pub use paste::paste;
}

/// Generate the C entry point `<ClassName>_create(threadNum)` plus the
/// registration hook for one node class. `$ctor` is a
/// `Fn(usize) -> FlowResult<Arc<dyn Node>>` expression.
#[macro_export]
macro_rules! enable_dynamic_loading {
    ($class:ident, $ctor:expr) => {
        $crate::registry::__private::paste! {
            #[allow(non_snake_case)]
            #[no_mangle]
            pub extern "C" fn [<$class _create>](thread_num: usize) -> *mut ::std::ffi::c_void {
                let ctor = $ctor;
                match ctor(thread_num) {
                    Ok(node) => {
                        let node: ::std::sync::Arc<dyn $crate::node::Node> = node;
                        ::std::boxed::Box::into_raw(::std::boxed::Box::new(node))
                            as *mut ::std::ffi::c_void
                    }
                    Err(_) => ::std::ptr::null_mut(),
                }
            }

            #[doc(hidden)]
            pub fn [<__fusionflow_register_ $class>](registry: &$crate::registry::NodeRegistry) {
                registry.register_ctor(::std::stringify!($class), $ctor);
            }
        }
    };
}

/// Generate the library-wide `fusionflow_plugin_register` entry point
/// covering every class previously declared with
/// [`enable_dynamic_loading!`].
#[macro_export]
macro_rules! export_plugin {
    ($($class:ident),+ $(,)?) => {
        $crate::registry::__private::paste! {
            #[no_mangle]
            pub extern "C" fn fusionflow_plugin_register(
                registry: &$crate::registry::NodeRegistry,
            ) {
                $( [<__fusionflow_register_ $class>](registry); )+
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EmitterNode;

    #[test]
    fn test_register_and_instantiate() {
        let registry = NodeRegistry::new();
        registry.register_ctor("EmitterNode", |threads| {
            Ok(Arc::new(EmitterNode::with_threads(1, 5, threads)) as Arc<dyn Node>)
        });
        assert!(registry.is_registered("EmitterNode"));

        let node = registry.instantiate("EmitterNode", 2).unwrap();
        assert_eq!(node.class_name(), "EmitterNode");
        assert_eq!(node.core().thread_num(), 2);
    }

    #[test]
    fn test_unknown_class_is_error() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.instantiate("NoSuchNode", 1),
            Err(FlowError::UnknownClass(_))
        ));
    }

    #[test]
    fn test_unregister_removes_class() {
        let registry = NodeRegistry::new();
        registry.register_ctor("EmitterNode", |_| {
            Ok(Arc::new(EmitterNode::new(1, 5)) as Arc<dyn Node>)
        });
        registry.unregister_ctor("EmitterNode");
        assert!(!registry.is_registered("EmitterNode"));
    }

    #[test]
    fn test_discover_libraries_recurses_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("a.so"), b"").unwrap();
        std::fs::write(nested.join("b.so"), b"").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"").unwrap();

        let found = discover_libraries(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a.so", "b.so"]);
    }

    #[test]
    fn test_load_rejects_non_library() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.so");
        std::fs::write(&bogus, b"not an elf").unwrap();
        assert!(NodeRegistry::new().load(&bogus).is_err());
    }
}
