//! Signed in-process hardware-access module backend
//!
//! Preferred backend. The module is searched for in the install directory,
//! then next to the running binary. When a digest is configured the file is
//! hashed before it is loaded and a mismatch skips that candidate.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::address::{Authorized, MsrAddress, PciConfigAddress, RegisterAddress};
use super::ffi::module_loader::ModuleLibrary;
use super::{Availability, BackendProvider, RegisterBackend};
use crate::data::BackendKind;
use crate::error::{OmenError, Result};

pub const MODULE_FILE_NAME: &str = "libomen_hwaccess.so";

/// Install directories searched before the bundled copy
pub const DEFAULT_MODULE_DIRS: &[&str] = &["/usr/lib/omenfan", "/usr/local/lib/omenfan"];

/// Default candidate paths, install directories first
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = DEFAULT_MODULE_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(MODULE_FILE_NAME))
        .collect();
    if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        paths.push(dir.join(MODULE_FILE_NAME));
    }
    paths
}

/// Lowercase hex SHA-256 of a file
pub fn file_sha256_hex(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| OmenError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

#[derive(Debug, Clone)]
pub struct SignedModuleProvider {
    pub search_paths: Vec<PathBuf>,
    pub expected_sha256: Option<String>,
}

impl Default for SignedModuleProvider {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
            expected_sha256: None,
        }
    }
}

impl BackendProvider for SignedModuleProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::SignedModule
    }

    fn create(&self) -> Box<dyn RegisterBackend> {
        Box::new(SignedModuleBackend::new(
            self.search_paths.clone(),
            self.expected_sha256.clone(),
        ))
    }
}

pub struct SignedModuleBackend {
    search_paths: Vec<PathBuf>,
    expected_sha256: Option<String>,
    module: Option<ModuleLibrary>,
    loaded_from: Option<PathBuf>,
}

impl SignedModuleBackend {
    pub fn new(search_paths: Vec<PathBuf>, expected_sha256: Option<String>) -> Self {
        Self {
            search_paths,
            expected_sha256: expected_sha256.map(|d| d.trim().to_ascii_lowercase()),
            module: None,
            loaded_from: None,
        }
    }

    pub fn loaded_from(&self) -> Option<&Path> {
        self.loaded_from.as_deref()
    }

    fn try_load(&self, path: &Path) -> Result<ModuleLibrary> {
        if !path.exists() {
            return Err(OmenError::unavailable(format!("{} not found", path.display())));
        }
        if let Some(expected) = &self.expected_sha256 {
            let actual = file_sha256_hex(path)?;
            if &actual != expected {
                return Err(OmenError::unavailable(format!(
                    "{} digest mismatch (got {})",
                    path.display(),
                    actual
                )));
            }
        }
        let module = ModuleLibrary::load(path)?;
        module
            .init()
            .map_err(|e| OmenError::unavailable(format!("{} not ready: {}", path.display(), e)))?;
        Ok(module)
    }

    fn module(&self) -> Result<&ModuleLibrary> {
        self.module
            .as_ref()
            .ok_or_else(|| OmenError::unavailable("signed module not loaded"))
    }
}

impl RegisterBackend for SignedModuleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SignedModule
    }

    fn open(&mut self) -> Result<Availability> {
        if self.module.is_some() {
            return Ok(Availability::Available);
        }
        let mut reasons = Vec::new();
        let candidates = self.search_paths.clone();
        for path in &candidates {
            match self.try_load(path) {
                Ok(module) => {
                    info!(path = %path.display(), "Loaded signed hardware-access module");
                    self.loaded_from = Some(path.clone());
                    self.module = Some(module);
                    return Ok(Availability::Available);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Module candidate rejected");
                    reasons.push(e.to_string());
                }
            }
        }
        if reasons.is_empty() {
            reasons.push("no search paths configured".to_string());
        }
        Ok(Availability::Unavailable(reasons.join("; ")))
    }

    fn is_available(&self) -> bool {
        self.module.is_some()
    }

    fn close(&mut self) {
        if self.module.take().is_some() {
            debug!("Unloaded signed hardware-access module");
        }
        self.loaded_from = None;
    }

    fn read_ec(&mut self, addr: RegisterAddress) -> Result<u8> {
        self.module()?.ec_read(addr.value())
    }

    fn write_ec(&mut self, addr: Authorized<RegisterAddress>, value: u8) -> Result<()> {
        self.module()?.ec_write(addr.target().value(), value)
    }

    fn read_msr(&mut self, addr: MsrAddress) -> Result<u64> {
        self.module()?.msr_read(addr.value())
    }

    fn write_msr(&mut self, addr: Authorized<MsrAddress>, value: u64) -> Result<()> {
        self.module()?.msr_write(addr.target().value(), value)
    }

    fn read_pci_config(&mut self, addr: PciConfigAddress) -> Result<u32> {
        self.module()?.pci_config_read(addr.bdf(), addr.offset() as u32)
    }

    fn write_pci_config(&mut self, addr: Authorized<PciConfigAddress>, value: u32) -> Result<()> {
        let target = addr.target();
        self.module()?
            .pci_config_write(target.bdf(), target.offset() as u32, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_missing_module_reports_unavailable() {
        let mut backend = SignedModuleBackend::new(vec![PathBuf::from("/nonexistent/libomen_hwaccess.so")], None);
        match backend.open().unwrap() {
            Availability::Unavailable(reason) => assert!(reason.contains("not found")),
            Availability::Available => panic!("module should not load"),
        }
        assert!(!backend.is_available());
        assert!(backend.read_ec(RegisterAddress::read_only(0x57)).is_err());
    }

    #[test]
    fn test_digest_mismatch_skips_candidate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MODULE_FILE_NAME);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"not a shared object").unwrap();

        let mut backend = SignedModuleBackend::new(vec![path], Some("00".repeat(32)));
        match backend.open().unwrap() {
            Availability::Unavailable(reason) => assert!(reason.contains("digest mismatch")),
            Availability::Available => panic!("tampered module accepted"),
        }
    }

    #[test]
    fn test_sha256_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        fs::File::create(&path).unwrap();
        assert_eq!(
            file_sha256_hex(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_default_search_paths_prefer_install_dir() {
        let paths = default_search_paths();
        assert_eq!(paths[0], Path::new("/usr/lib/omenfan").join(MODULE_FILE_NAME));
    }
}
