//! ROM and bundled disk resources loaded from a ZIP package.
//!
//! A resource package is a ZIP file containing ROM images and disk dumps
//! under their resource paths (`rom/z1013/mon202.bin`,
//! `disks/z9001/z9cpasys.dump.gz`, ...) and an optional `manifest.json`
//! describing the package. Everything is read once into an immutable
//! [`RomResources`] that machines share through an `Arc`.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use crate::config::Properties;
use crate::error::{KcError, KcResult};

/// ROM entry listed in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RomEntry {
    pub path: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Resource package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub roms: Vec<RomEntry>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// Immutable path to bytes map.
#[derive(Debug, Clone, Default)]
pub struct RomResources {
    manifest: Option<ResourceManifest>,
    files: HashMap<String, Arc<[u8]>>,
}

/// Resource paths are kept with a leading slash.
fn normalize_path(name: &str) -> String {
    let name = name.replace('\\', "/");
    if name.starts_with('/') {
        name
    } else {
        format!("/{}", name)
    }
}

impl RomResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all entries of a ZIP package.
    pub fn load<R: Read + Seek>(reader: R) -> KcResult<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let mut res = Self::new();

        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;

            if name.eq_ignore_ascii_case("manifest.json") {
                match serde_json::from_slice::<ResourceManifest>(&content) {
                    Ok(m) => res.manifest = Some(m),
                    Err(e) => log::warn!("ignoring malformed resource manifest: {}", e),
                }
            } else {
                res.files.insert(normalize_path(&name), content.into());
            }
        }
        log::debug!("loaded {} resources", res.files.len());
        Ok(res)
    }

    pub fn load_from_path(path: &Path) -> KcResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::load(std::io::BufReader::new(file))
    }

    /// Add or replace one resource.
    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(normalize_path(path), data.into());
    }

    pub fn manifest(&self) -> Option<&ResourceManifest> {
        self.manifest.as_ref()
    }

    pub fn get(&self, path: &str) -> Option<Arc<[u8]>> {
        self.files.get(&normalize_path(path)).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_path(path))
    }

    pub fn require(&self, path: &str) -> KcResult<Arc<[u8]>> {
        self.get(path)
            .ok_or_else(|| KcError::ResourceNotFound(path.to_string()))
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.files.keys().map(|s| s.as_str()).collect();
        paths.sort_unstable();
        paths
    }

    /// ROM image named by a property, falling back to the bundled resource.
    ///
    /// Returns `None` when neither is available; the caller then leaves the
    /// ROM area reading as 0xFF.
    pub fn rom_from_settings(
        &self,
        props: &Properties,
        file_key: &str,
        resource: &str,
    ) -> Option<Arc<[u8]>> {
        if let Some(file) = props.get_str(file_key) {
            match std::fs::read(file) {
                Ok(data) if !data.is_empty() => return Some(data.into()),
                Ok(_) => log::warn!("ROM file {} is empty, using {}", file, resource),
                Err(e) => log::warn!("cannot read ROM file {}: {}, using {}", file, e, resource),
            }
        }
        let rom = self.get(resource);
        if rom.is_none() {
            log::warn!("ROM resource {} not available", resource);
        }
        rom
    }
}
