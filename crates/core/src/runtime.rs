//! ONNX Runtime shared-library discovery.
//!
//! `ort` is built with `load-dynamic`, so `libonnxruntime` is located at
//! startup and exported through `ORT_DYLIB_PATH` before the first session.
//! CUDA, cuDNN and TensorRT libraries found alongside it are preloaded.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// Probe order: `<data_dir>/lib`, `<exe_dir>/lib`, `<exe_dir>/../lib`,
/// `<cwd>/lib`, then the system library dirs on Unix.
fn candidate_lib_dirs(data_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(data_dir) = data_dir {
        push(data_dir.join("lib"));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for GPU runtime libs, lowest first; `None` for anything that
/// must not be preloaded. ORT provider libs need `libonnxruntime` symbols,
/// so `ort` loads them itself.
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Preloadable libs in `dirs`, ordered CUDA → cuDNN → TensorRT.
/// The first directory holding a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// What [`setup_runtime_libs`] found, for logging once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    pub ort_dylib: Option<PathBuf>,
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Call at the start of `main()`, before any session is built.
pub fn setup_runtime_libs(data_dir: Option<&Path>) -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs(data_dir);
    let mut status = RuntimeLibStatus::default();

    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        status.ort_from_env = true;
        status.ort_dylib = Some(PathBuf::from(existing));
    } else if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
        env::set_var(ORT_DYLIB_ENV, &path);
        status.ort_dylib = Some(path);
    }

    for lib in collect_preload_libs(&dirs) {
        if unsafe { load_library(&lib) } {
            status.preloaded.push(lib);
        }
    }
    status
}

pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match &status.ort_dylib {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), from_env = status.ort_from_env, "ONNX Runtime library");
        }
        Some(path) => warn!(
            path = %path.display(),
            "{ORT_DYLIB_ENV} points to a missing file"
        ),
        None => warn!("{ORT_DYLIB_ENV} not set; ONNX Runtime will use default search paths"),
    }
    for lib in &status.preloaded {
        tracing::debug!(path = %lib.display(), "Preloaded GPU runtime library");
    }
}
