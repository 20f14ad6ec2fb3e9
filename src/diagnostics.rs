use crate::config::Config;

pub fn check(cfg: &Config) -> anyhow::Result<()> {
    let mut errors: Vec<String> = Vec::new();

    // Check 1: TPM device readable
    if let Some(path) = cfg.tpm_device_path() {
        if let Err(e) = std::fs::OpenOptions::new().read(true).write(true).open(path) {
            errors.push(format!(
                "cannot open {path}: {e}\n  \
                 → add yourself to the 'tss' group: sudo usermod -aG tss $USER"
            ));
        }
    }

    // Check 2: data dir creatable
    match cfg.objects_dir() {
        Ok(dir) => {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                errors.push(format!(
                    "cannot create {}: {e}\n  \
                     → pass a writable directory with --store-dir",
                    dir.display()
                ));
            }
        }
        Err(e) => errors.push(e.to_string()),
    }

    if errors.is_empty() {
        return Ok(());
    }

    for err in &errors {
        eprintln!("ERROR: {err}");
    }
    anyhow::bail!("{} preflight check(s) failed", errors.len());
}
