use std::path::PathBuf;

use crate::error::{Error, Result};

pub const APP_NAME: &str = "tpmtok";
pub const OBJECTS_DIR: &str = "objects";
pub const WRAPPING_KEY_FILE: &str = "wrapping_key.blob";
pub const LOCK_FILE: &str = "tpmtok.lock";
/// Environment variable carrying the object auth for `--import-handle`.
pub const OBJECT_AUTH_ENV: &str = "TPMTOK_OBJECT_AUTH";

fn parse_tpm_handle(s: &str) -> std::result::Result<u32, String> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"));
    match digits {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid TPM handle {s:?}: {e}"))
}

#[derive(clap::Parser, Debug, Clone)]
#[command(name = "tpmtok", version, about = "TPM-backed PKCS#11 token object store")]
pub struct Config {
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// TPM device path or full TCTI string (e.g. `mssim:host=localhost`).
    #[arg(long, default_value = "/dev/tpmrm0")]
    pub tpm_device: String,
    /// Token data directory. Defaults to the XDG data dir.
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
    /// Print every object in the token, then exit.
    #[arg(long)]
    pub list: bool,
    /// Delete all stored objects, then exit.
    #[arg(long, conflicts_with = "list")]
    pub wipe: bool,
    /// Expose the persistent TPM key at this handle (e.g. `0x81010001`) as a
    /// key pair. Its auth, if any, is read from `TPMTOK_OBJECT_AUTH`.
    #[arg(long, value_parser = parse_tpm_handle, requires_all = ["id", "label"], conflicts_with = "wipe")]
    pub import_handle: Option<u32>,
    /// Object id for `--import-handle`, below 65536.
    #[arg(long)]
    pub id: Option<u32>,
    /// Label for `--import-handle`.
    #[arg(long)]
    pub label: Option<String>,
}

impl Config {
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.store_dir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| Error::Config("cannot determine XDG data dir".into()))
    }

    pub fn objects_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(OBJECTS_DIR))
    }

    /// TCTI devices are the only ones that can be checked on the filesystem.
    pub fn tpm_device_path(&self) -> Option<&str> {
        match self.tpm_device.split_once(':') {
            None => Some(&self.tpm_device),
            Some(("device", path)) => Some(path),
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults_and_overrides() {
        let cfg = Config::parse_from(["tpmtok"]);
        assert_eq!(cfg.tpm_device, "/dev/tpmrm0");
        assert_eq!(cfg.tpm_device_path(), Some("/dev/tpmrm0"));
        assert!(!cfg.list && !cfg.wipe);

        let cfg = Config::parse_from(["tpmtok", "-vv", "--store-dir", "/tmp/tok", "--tpm-device", "mssim:port=2321", "--list"]);
        assert_eq!(cfg.verbose, 2);
        assert_eq!(cfg.objects_dir().unwrap(), PathBuf::from("/tmp/tok/objects"));
        assert_eq!(cfg.tpm_device_path(), None);
        assert!(cfg.list);
    }

    #[test]
    fn test_import_arguments() {
        let cfg = Config::parse_from(["tpmtok", "--import-handle", "0x81010002", "--id", "2", "--label", "rsa_auth"]);
        assert_eq!(cfg.import_handle, Some(0x8101_0002));
        assert_eq!(cfg.id, Some(2));
        assert_eq!(cfg.label.as_deref(), Some("rsa_auth"));

        let cfg = Config::parse_from(["tpmtok", "--import-handle", "2164326401", "--id", "1", "--label", "x"]);
        assert_eq!(cfg.import_handle, Some(0x8101_0001));

        assert!(Config::try_parse_from(["tpmtok", "--import-handle", "0x81010002"]).is_err());
        assert!(Config::try_parse_from(["tpmtok", "--import-handle", "0xzz", "--id", "1", "--label", "x"]).is_err());
    }

    #[test]
    fn test_list_and_wipe_conflict() {
        assert!(Config::try_parse_from(["tpmtok", "--list", "--wipe"]).is_err());
    }
}
