//! VST3 module loading.
//!
//! Resolves `.vst3` bundles to their platform binary, opens the library,
//! obtains the `IPluginFactory`, and enumerates its classes. VST3 plugins are
//! distributed as `.vst3` bundles which contain:
//! - macOS: `Contents/MacOS/<name>`
//! - Windows: `Contents/x86_64-win/<name>.vst3`
//! - Linux: `Contents/x86_64-linux/<name>.so`

use crate::com::{
    self, AUDIO_EFFECT_CLASS, ComPtr, GetPluginFactoryFn, IPluginFactoryVtbl,
    K_RESULT_OK, PClassInfo, PFactoryInfo, Tuid,
};
use cuehost_plugin::PluginError;
use libloading::{Library, Symbol};
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::path::{Component, Path, PathBuf};

/// Information about a class exported by the factory
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub class_id: Tuid,
    pub category: String,
    pub name: String,
}

/// An opened VST3 module: library plus factory.
///
/// Objects created through the factory must be released before the module
/// is dropped.
pub struct Vst3Module {
    factory: ManuallyDrop<ComPtr<IPluginFactoryVtbl>>,
    vendor: String,
    path: PathBuf,
    library: Library,
}

// SAFETY: the factory is documented as callable from any thread; the host
// never calls it concurrently because the owning instance is serialized.
#[allow(unsafe_code)]
unsafe impl Send for Vst3Module {}

impl Vst3Module {
    /// Open a `.vst3` bundle or a bare module binary.
    #[allow(unsafe_code)] // Required for FFI
    pub fn open(path: &Path) -> Result<Self, PluginError> {
        validate_plugin_path(path)?;

        let library_path = if path.is_dir() {
            bundle_library_path(path)?
        } else {
            path.to_path_buf()
        };

        if !library_path.exists() {
            return Err(PluginError::FormatError(format!(
                "VST3 library not found at: {}",
                library_path.display()
            )));
        }

        tracing::debug!("Loading VST3 library: {}", library_path.display());
        let library = open_library(&library_path)?;

        let get_factory: Symbol<GetPluginFactoryFn> = unsafe {
            library.get(b"GetPluginFactory").map_err(|e| {
                PluginError::FormatError(format!("GetPluginFactory symbol not found: {e}"))
            })?
        };

        let factory_ptr: *mut c_void = unsafe { get_factory() };
        // SAFETY: GetPluginFactory returns an owned IPluginFactory reference.
        let factory = unsafe { ComPtr::<IPluginFactoryVtbl>::from_raw(factory_ptr) }
            .ok_or_else(|| PluginError::FormatError("GetPluginFactory returned null".into()))?;

        let mut info: PFactoryInfo = com::zeroed();
        let vendor = if unsafe { (factory.vtbl().get_factory_info)(factory.as_ptr(), &raw mut info) }
            == K_RESULT_OK
        {
            com::c_chars_to_string(&info.vendor)
        } else {
            String::new()
        };

        Ok(Self {
            factory: ManuallyDrop::new(factory),
            vendor,
            path: path.to_path_buf(),
            library,
        })
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every class the factory exports
    #[allow(unsafe_code)]
    pub fn classes(&self) -> Vec<ClassInfo> {
        let count = unsafe { (self.factory.vtbl().count_classes)(self.factory.as_ptr()) };
        (0..count.max(0))
            .filter_map(|index| {
                let mut raw: PClassInfo = com::zeroed();
                let result = unsafe {
                    (self.factory.vtbl().get_class_info)(self.factory.as_ptr(), index, &raw mut raw)
                };
                (result == K_RESULT_OK).then(|| ClassInfo {
                    class_id: raw.cid,
                    category: com::c_chars_to_string(&raw.category),
                    name: com::c_chars_to_string(&raw.name),
                })
            })
            .collect()
    }

    /// First class in the audio processor category
    pub fn audio_class(&self) -> Result<ClassInfo, PluginError> {
        self.classes()
            .into_iter()
            .find(|class| class.category == AUDIO_EFFECT_CLASS)
            .ok_or_else(|| {
                PluginError::FormatError(format!(
                    "{} exports no '{AUDIO_EFFECT_CLASS}'",
                    self.path.display()
                ))
            })
    }

    /// `createInstance` for class `cid`, returning interface `V` identified by `iid`.
    #[allow(unsafe_code)]
    pub fn create_instance<V>(&self, cid: &Tuid, iid: &Tuid) -> Result<ComPtr<V>, PluginError> {
        let mut obj = std::ptr::null_mut();
        let result = unsafe {
            (self.factory.vtbl().create_instance)(
                self.factory.as_ptr(),
                cid.as_ptr().cast(),
                iid.as_ptr().cast(),
                &raw mut obj,
            )
        };
        if result != K_RESULT_OK {
            return Err(PluginError::InitializationFailed(format!(
                "createInstance failed with result {result}"
            )));
        }
        // SAFETY: createInstance hands back one reference to the requested interface.
        unsafe { ComPtr::from_raw(obj) }
            .ok_or_else(|| PluginError::InitializationFailed("createInstance returned null".into()))
    }
}

impl Drop for Vst3Module {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: the factory is never touched again after this point.
        unsafe { ManuallyDrop::drop(&mut self.factory) };

        #[cfg(target_os = "linux")]
        if let Ok(exit) = unsafe { self.library.get::<com::ModuleExitFn>(b"ModuleExit") } {
            unsafe { exit() };
        }
        // `library` unloads when the field drops.
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn open_library(path: &Path) -> Result<Library, PluginError> {
    let library = unsafe { libloading::os::unix::Library::new(path) }
        .map_err(|e| PluginError::FormatError(format!("Failed to load VST3 library: {e}")))?;
    let handle = library.into_raw();
    // SAFETY: `handle` came from `into_raw` and is turned back into an owner below.
    let library = unsafe { libloading::os::unix::Library::from_raw(handle) };
    if let Ok(entry) = unsafe { library.get::<com::ModuleEntryFn>(b"ModuleEntry") } {
        if !unsafe { entry(handle) } {
            return Err(PluginError::InitializationFailed(
                "ModuleEntry returned false".into(),
            ));
        }
    }
    Ok(Library::from(library))
}

#[cfg(not(target_os = "linux"))]
#[allow(unsafe_code)]
fn open_library(path: &Path) -> Result<Library, PluginError> {
    // TODO: call bundleEntry with a CFBundleRef on macOS
    unsafe { Library::new(path) }
        .map_err(|e| PluginError::FormatError(format!("Failed to load VST3 library: {e}")))
}

/// Get the platform-specific library path within a VST3 bundle
pub fn bundle_library_path(bundle_path: &Path) -> Result<PathBuf, PluginError> {
    let name = bundle_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| PluginError::FormatError("Invalid bundle name".to_string()))?;
    let contents = bundle_path.join("Contents");

    if cfg!(target_os = "macos") {
        Ok(contents.join("MacOS").join(name))
    } else if cfg!(target_os = "windows") {
        Ok(contents
            .join(format!("{}-win", std::env::consts::ARCH))
            .join(format!("{name}.vst3")))
    } else {
        Ok(contents
            .join(format!("{}-linux", std::env::consts::ARCH))
            .join(format!("{name}.so")))
    }
}

/// Validate plugin path
///
/// Rejects paths with `..` components and extensionless files.
pub fn validate_plugin_path(path: &Path) -> Result<(), PluginError> {
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(PluginError::FormatError(
            "Plugin path cannot contain '..' components (directory traversal)".to_string(),
        ));
    }

    if let Ok(canonical_path) = path.canonicalize() {
        if canonical_path.extension().is_none() && !canonical_path.is_dir() {
            return Err(PluginError::FormatError(
                "Plugin path must be a .vst3 bundle or dynamic library file".to_string(),
            ));
        }
    }
    Ok(())
}
