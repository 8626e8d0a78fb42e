use crate::error::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Copies binding-redirect `.config` files next to the binaries that need them.
pub trait ConfigStager: Send + Sync {
    /// Writes `source` to `dest_dir/<dest_base_name>.config`, replacing any existing file.
    fn copy_config(&self, source: &Path, dest_dir: &Path, dest_base_name: &str) -> Result<PathBuf>;
}

/// Produces the contents of `mods.json` for a folder of mods.
pub trait ManifestBuilder: Send + Sync {
    fn build_manifest(&self, mods_folder: &Path) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsConfigStager;

impl ConfigStager for FsConfigStager {
    fn copy_config(&self, source: &Path, dest_dir: &Path, dest_base_name: &str) -> Result<PathBuf> {
        let dest = dest_dir.join(format!("{dest_base_name}.config"));
        fs::copy(source, &dest)?;
        log::debug!("Copied {} to {}", source.display(), dest.display());
        Ok(dest)
    }
}

/// Picks the binding-redirect file for a framework library: its own
/// `<dll>.config` if present, else the default framework's.
pub fn redirect_source(framework_library: &Path, default_framework: &Path) -> Option<PathBuf> {
    let specific = config_path(framework_library);
    if specific.is_file() {
        return Some(specific);
    }

    let fallback = config_path(default_framework);
    if fallback.is_file() {
        log::warn!(
            "Framework does not have a specific binding redirect file, falling back to {}",
            fallback.display()
        );
        return Some(fallback);
    }

    log::warn!(
        "Could not find a binding redirect file at {}",
        specific.display()
    );
    None
}

fn config_path(library: &Path) -> PathBuf {
    let mut name = library.as_os_str().to_owned();
    name.push(".config");
    PathBuf::from(name)
}

/// Enables every sub-directory of the mods folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderManifestBuilder;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ModsManifest {
    enabled_mods: Vec<ModEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ModEntry {
    mod_id: String,
    mod_path: PathBuf,
    enabled: bool,
}

impl ManifestBuilder for FolderManifestBuilder {
    fn build_manifest(&self, mods_folder: &Path) -> Result<Vec<u8>> {
        let root = fs::canonicalize(mods_folder)?;
        let mut enabled_mods = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            enabled_mods.push(ModEntry {
                mod_id: entry.file_name().to_string_lossy().into_owned(),
                mod_path: entry.path(),
                enabled: true,
            });
        }
        enabled_mods.sort_by(|a, b| a.mod_id.cmp(&b.mod_id));
        log::info!("Enabling {} mod(s) from {}", enabled_mods.len(), root.display());

        Ok(serde_json::to_vec_pretty(&ModsManifest { enabled_mods })?)
    }
}
