pub mod config;
pub mod diagnostics;
pub mod error;
pub mod object;
pub mod store;
pub mod tpm;
pub mod transport;

use std::path::Path;
use std::sync::Arc;

pub use error::{Error, Result};
pub use object::{
    AttrList, AttrRequest, Attribute, FindSession, ImportOnlyInitializer, ImportRequest,
    NativeInitializer, ObjectError, ObjectId, ObjectInitializer, Registry, SessionAuth, SessionId,
    TokenObject,
};

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Open the sealed auth-wrapping key, creating and sealing a fresh one on
/// first use.
pub fn load_or_create_session_auth(tpm: &tpm::TpmContext, path: &Path) -> Result<SessionAuth> {
    let key = if path.exists() {
        let sealed = tpm::seal::SealedKey::from_bytes(&std::fs::read(path)?)?;
        tpm.with_ctx(|ctx, primary| tpm::seal::unseal(ctx, primary, &sealed))?
    } else {
        let (sealed, key) = tpm.with_ctx(|ctx, primary| tpm::seal::create_seal(ctx, primary))?;
        std::fs::write(path, sealed.to_bytes())?;
        tracing::info!(path = %path.display(), "Created wrapping key");
        key
    };
    Ok(SessionAuth::new(*key))
}

/// Print one line per object, in id order.
pub fn list_objects(registry: &Registry, out: &mut impl std::io::Write) -> Result<usize> {
    use cryptoki_sys::{CKA_CLASS, CKA_LABEL};

    let mut search = FindSession::new();
    search.find_init(registry, &[])?;
    let handles = search.find(registry, usize::MAX)?;
    search.find_final()?;

    for handle in &handles {
        let info = registry.snapshot(*handle)?;
        let class = info
            .attrs
            .get_ulong(CKA_CLASS)
            .map(|c| format!("{c:#x}"))
            .unwrap_or_else(|| "-".into());
        let label = info
            .attrs
            .get(CKA_LABEL)
            .map(|l| String::from_utf8_lossy(&l.value).into_owned())
            .unwrap_or_default();
        let link = info.link.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
        writeln!(
            out,
            "{}\thandle={}\tclass={}\tlink={}\tlabel={}",
            info.id, info.handle, class, link, label
        )?;
    }
    Ok(handles.len())
}

/// Link a persistent TPM key into the token and report the new pair.
pub fn import_persistent(
    registry: &Registry,
    request: ImportRequest,
    session_auth: &SessionAuth,
    out: &mut impl std::io::Write,
) -> Result<(cryptoki_sys::CK_OBJECT_HANDLE, cryptoki_sys::CK_OBJECT_HANDLE)> {
    let persistent = request.persistent_handle;
    let (private, public) = registry.import(request, session_auth)?;
    let info = registry.snapshot(private)?;
    writeln!(
        out,
        "Imported {persistent:#x} as object {} (private handle {private}, public handle {public})",
        info.id
    )?;
    Ok((private, public))
}

fn import_request(cfg: &config::Config, persistent_handle: u32) -> anyhow::Result<ImportRequest> {
    let id = cfg
        .id
        .ok_or_else(|| anyhow::anyhow!("--import-handle requires --id"))?;
    let label = cfg
        .label
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--import-handle requires --label"))?;
    let auth = std::env::var_os(config::OBJECT_AUTH_ENV)
        .map(|v| zeroize::Zeroizing::new(v.into_encoded_bytes()));
    Ok(ImportRequest {
        id,
        persistent_handle,
        label,
        auth,
    })
}

fn lock_path(data_dir: &Path) -> std::path::PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| data_dir.to_path_buf())
        .join(config::LOCK_FILE)
}

fn open_lock(data_dir: &Path) -> anyhow::Result<(fd_lock::RwLock<std::fs::File>, std::path::PathBuf)> {
    let path = lock_path(data_dir);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    Ok((fd_lock::RwLock::new(file), path))
}

pub fn wipe(cfg: config::Config) -> anyhow::Result<()> {
    init_logging(cfg.verbose);
    let data_dir = cfg.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let (mut lock, lock_path) = open_lock(&data_dir)?;
    let _guard = lock
        .try_write()
        .map_err(|_| anyhow::anyhow!("token store is in use (lock: {})", lock_path.display()))?;

    let mut store = store::DiskStore::open(cfg.objects_dir()?)?;
    let count = store.wipe()?;
    println!("Deleted {count} object(s) from {}", store.dir().display());
    Ok(())
}

pub fn run(cfg: config::Config) -> anyhow::Result<()> {
    init_logging(cfg.verbose);
    tracing::info!("Starting tpmtok");

    diagnostics::check(&cfg)?;

    let data_dir = cfg.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let (mut lock, lock_path) = open_lock(&data_dir)?;
    let _guard = lock
        .try_write()
        .map_err(|_| anyhow::anyhow!("token store is in use (lock: {})", lock_path.display()))?;

    let tpm = tpm::TpmContext::new(&cfg.tpm_device)
        .map_err(|e| anyhow::anyhow!("Failed to initialize TPM: {e}"))?;
    tracing::info!(tcti = tpm.tcti(), "TPM context initialized");

    let session_auth = load_or_create_session_auth(&tpm, &data_dir.join(config::WRAPPING_KEY_FILE))?;
    tracing::info!("Wrapping key ready");

    let store = store::DiskStore::open(cfg.objects_dir()?)?;
    let transport = Arc::new(tpm::TpmTransport::new(tpm));
    let registry = Registry::open(store, transport, NativeInitializer)?;
    let count = registry.object_count()?;
    tracing::info!(count, "Token objects loaded");

    let stdout = std::io::stdout();
    if let Some(handle) = cfg.import_handle {
        let request = import_request(&cfg, handle)?;
        import_persistent(&registry, request, &session_auth, &mut stdout.lock())?;
    } else if cfg.list {
        list_objects(&registry, &mut stdout.lock())?;
    } else {
        println!("{count} object(s) in {}", data_dir.display());
    }
    Ok(())
}
