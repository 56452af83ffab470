//! Library search-path resolution for `-l` and script `INPUT`/`GROUP`
//! namespecs.
//!
//! `-lfoo` looks for `libfoo.so` then `libfoo.a` in each `-L` directory in
//! order; `-static` restricts the search to archives. A namespec starting
//! with `:` names an exact file. Search-path entries beginning with `=`
//! are rerooted under `--sysroot`.

use crate::config::LinkConfig;
use crate::diag::{DiagId, DiagnosticEntry, Result};
use std::path::{Path, PathBuf};

/// Apply the sysroot rule to one `-L` entry.
fn effective_dir(config: &LinkConfig, dir: &Path) -> PathBuf {
    let text = dir.to_string_lossy();
    if let Some(rest) = text.strip_prefix('=') {
        if let Some(sysroot) = &config.sysroot {
            return sysroot.join(rest.trim_start_matches('/'));
        }
        return PathBuf::from(rest);
    }
    dir.to_path_buf()
}

fn find_in_dirs(config: &LinkConfig, file_name: &str) -> Option<PathBuf> {
    for dir in &config.search_dirs {
        let candidate = effective_dir(config, dir).join(file_name);
        if candidate.is_file() {
            log::debug!("found {file_name} at {}", candidate.display());
            return Some(candidate);
        }
    }
    None
}

/// Resolve a `-l namespec` to a path.
pub fn find_library(config: &LinkConfig, namespec: &str) -> Result<PathBuf> {
    if let Some(exact) = namespec.strip_prefix(':') {
        if let Some(found) = find_in_dirs(config, exact) {
            return Ok(found);
        }
        return Err(DiagnosticEntry::fatal(
            DiagId::ERROR_NOT_FOUND_LIBRARY,
            vec![namespec.to_string()],
        ));
    }
    if !config.is_static {
        if let Some(found) = find_in_dirs(config, &format!("lib{namespec}.so")) {
            return Ok(found);
        }
    }
    if let Some(found) = find_in_dirs(config, &format!("lib{namespec}.a")) {
        return Ok(found);
    }
    Err(DiagnosticEntry::fatal(
        DiagId::ERROR_NOT_FOUND_LIBRARY,
        vec![namespec.to_string()],
    ))
}

/// Resolve a script `INPUT(name)` operand: an existing path is used as-is,
/// `-lfoo` syntax goes through the library search, and a bare name that is
/// not a path is searched in the `-L` directories.
pub fn find_input(config: &LinkConfig, name: &str) -> Result<PathBuf> {
    if let Some(lib) = name.strip_prefix("-l") {
        return find_library(config, lib);
    }
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return Ok(direct);
    }
    if let Some(found) = find_in_dirs(config, name) {
        return Ok(found);
    }
    Err(DiagnosticEntry::fatal(
        DiagId::FATAL_CANNOT_READ_INPUT,
        vec![name.to_string(), "No such file or directory".to_string()],
    ))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysroot_rerooting() {
        let config = LinkConfig::builder()
            .sysroot(PathBuf::from("/opt/sdk"))
            .build();
        assert_eq!(
            effective_dir(&config, Path::new("=/usr/lib")),
            PathBuf::from("/opt/sdk/usr/lib")
        );
        assert_eq!(
            effective_dir(&config, Path::new("/usr/lib")),
            PathBuf::from("/usr/lib")
        );
        let bare = LinkConfig::builder().build();
        assert_eq!(
            effective_dir(&bare, Path::new("=/usr/lib")),
            PathBuf::from("/usr/lib")
        );
    }

    #[test]
    fn test_missing_library_is_fatal() {
        let config = LinkConfig::builder().build();
        let err = find_library(&config, "definitely_not_there").unwrap_err();
        assert_eq!(err.id, DiagId::ERROR_NOT_FOUND_LIBRARY);
    }
}
