use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cfg = tpmtok::config::Config::parse();
    if cfg.wipe {
        tpmtok::wipe(cfg)
    } else {
        tpmtok::run(cfg)
    }
}
