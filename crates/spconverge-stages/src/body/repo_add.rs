use std::path::{Path, PathBuf};

use spconverge_core::ConvergeResult;
use spconverge_txn::FileAttrs;
use tracing::{debug, info};

use super::{rollback_files, StageBody};
use crate::os_release::read_codename;
use crate::{StageContext, StageId};

const SETTING_REPO_URL: &str = "storpool_repo_url";
const SETTING_REPO_KEYRING: &str = "storpool_repo_keyring";

const SOURCES_FILE: &str = "storpool.sources";
const KEYRING_FILE: &str = "storpool-keyring.gpg";

/// Leftovers of the older MAAS-based repository setup.
pub const OBSOLETE_REPO_FILES: &[&str] = &[
    "/etc/apt/sources.list.d/storpool-maas.list",
    "/etc/apt/trusted.gpg.d/storpool-maas.key",
];

/// Adds the StorPool package repository to APT.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepoAddBody;

/// A deb822 source stanza for the StorPool repository.
pub fn render_sources(url: &str, codename: &str, keyring: Option<&Path>) -> String {
    let mut out = format!("Types: deb\nURIs: {url}\nSuites: {codename}\nComponents: main\n");
    if let Some(keyring) = keyring {
        out.push_str(&format!("Signed-By: {}\n", keyring.display()));
    }
    out
}

impl StageBody for RepoAddBody {
    fn converge(&self, ctx: &StageContext) -> ConvergeResult<()> {
        let stage = StageId::RepoAdd;
        let url = ctx.settings().require_one(SETTING_REPO_URL)?;
        debug!(url = %url, "got a repository URL");

        let layout = ctx.layout();
        let codename = read_codename(&layout.os_release_path())?;
        let attrs = FileAttrs::with_mode(0o644);

        let keyring = match ctx.settings().string(SETTING_REPO_KEYRING) {
            Some(source) => {
                let host_keyring = PathBuf::from("/usr/share/keyrings").join(KEYRING_FILE);
                ctx.installer().install(
                    &stage.txn_module(),
                    &layout.host_path(source),
                    &layout.keyrings_dir().join(KEYRING_FILE),
                    &attrs,
                )?;
                Some(host_keyring)
            }
            None => None,
        };

        let sources = render_sources(&url, &codename, keyring.as_deref());
        let outcome = ctx.installer().install_bytes(
            &stage.txn_module(),
            sources.as_bytes(),
            &layout.apt_sources_dir().join(SOURCES_FILE),
            &attrs,
        )?;
        info!(codename = %codename, outcome = ?outcome, "configured the StorPool repository");

        for obsolete in OBSOLETE_REPO_FILES {
            if ctx
                .installer()
                .remove(&stage.txn_module(), &layout.host_path(obsolete))?
            {
                info!(path = obsolete, "removed an obsolete repository file");
            }
        }

        ctx.packages().update_index()?;
        Ok(())
    }

    fn teardown(&self, ctx: &StageContext) -> ConvergeResult<()> {
        rollback_files(ctx, StageId::RepoAdd);
        Ok(())
    }
}
