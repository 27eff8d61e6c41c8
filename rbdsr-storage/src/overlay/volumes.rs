//! Logical-volume lifecycle inside an isolated LVM configuration scope.

use async_trait::async_trait;
use rbdsr_core::Result;
use rbdsr_platform::Gateway;
use rbdsr_platform::lvm::{LvReport, VgReport};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Only kernel RBD devices are scanned, so nothing on the host's own disks
/// is ever seen or touched from a repository scope.
const SCOPED_LVM_CONF: &str = r#"# Written by rbdsr. Confines lvm to kernel RBD devices.
devices {
    filter = [ "a|^/dev/rbd[0-9]+$|", "r|.*|" ]
    global_filter = [ "a|^/dev/rbd[0-9]+$|", "r|.*|" ]
    types = [ "rbd", 1024 ]
    obtain_device_list_from_udev = 0
}
global {
    use_lvmetad = 0
}
backup {
    backup = 0
    archive = 0
}
"#;

/// Everything the composition layer needs from a volume manager. Each call
/// names the configuration scope it runs in.
#[async_trait]
pub trait LogicalVolumes: Send + Sync {
    async fn prepare_scope(&self, scope: &Path) -> Result<()>;
    async fn remove_scope(&self, scope: &Path) -> Result<()>;

    async fn create_group(&self, scope: &Path, vg: &str, device: &Path) -> Result<()>;
    async fn remove_group(&self, scope: &Path, vg: &str) -> Result<()>;
    async fn set_group_active(&self, scope: &Path, vg: &str, active: bool) -> Result<()>;
    async fn export_group(&self, scope: &Path, vg: &str) -> Result<()>;
    async fn import_group(&self, scope: &Path, vg: &str) -> Result<()>;
    /// `None` when the group is not visible in `scope`.
    async fn group(&self, scope: &Path, vg: &str) -> Result<Option<VgReport>>;
    /// Name of the volume group whose physical volume is `device`, if any.
    async fn group_on_device(&self, scope: &Path, device: &Path) -> Result<Option<String>>;
    async fn grow_physical(&self, scope: &Path, device: &Path) -> Result<()>;

    async fn create_volume(&self, scope: &Path, vg: &str, lv: &str, bytes: u64) -> Result<PathBuf>;
    async fn snapshot_volume(
        &self,
        scope: &Path,
        vg: &str,
        origin: &str,
        lv: &str,
        bytes: u64,
        read_only: bool,
    ) -> Result<PathBuf>;
    async fn remove_volume(&self, scope: &Path, vg: &str, lv: &str) -> Result<()>;
    async fn resize_volume(
        &self,
        scope: &Path,
        vg: &str,
        lv: &str,
        bytes: u64,
        force: bool,
    ) -> Result<()>;
    async fn set_volume_active(&self, scope: &Path, vg: &str, lv: &str, active: bool)
    -> Result<()>;
    async fn volumes(&self, scope: &Path, vg: &str) -> Result<Vec<LvReport>>;
}

/// `LogicalVolumes` backed by the `lvm` tool.
pub struct LvmVolumes {
    gateway: Gateway,
}

impl LvmVolumes {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl LogicalVolumes for LvmVolumes {
    async fn prepare_scope(&self, scope: &Path) -> Result<()> {
        let conf = scope.join("lvm.conf");
        if fs::try_exists(&conf).await? {
            return Ok(());
        }
        fs::create_dir_all(scope).await?;
        fs::write(&conf, SCOPED_LVM_CONF).await?;
        info!("Wrote scoped lvm configuration {}", conf.display());
        Ok(())
    }

    async fn remove_scope(&self, scope: &Path) -> Result<()> {
        match fs::remove_dir_all(scope).await {
            Ok(()) => {
                debug!("Removed lvm scope {}", scope.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_group(&self, scope: &Path, vg: &str, device: &Path) -> Result<()> {
        self.gateway.lvm(scope).vg_create(vg, device).await
    }

    async fn remove_group(&self, scope: &Path, vg: &str) -> Result<()> {
        self.gateway.lvm(scope).vg_remove(vg).await
    }

    async fn set_group_active(&self, scope: &Path, vg: &str, active: bool) -> Result<()> {
        self.gateway.lvm(scope).vg_activate(vg, active).await
    }

    async fn export_group(&self, scope: &Path, vg: &str) -> Result<()> {
        self.gateway.lvm(scope).vg_export(vg).await
    }

    async fn import_group(&self, scope: &Path, vg: &str) -> Result<()> {
        self.gateway.lvm(scope).vg_import(vg).await
    }

    async fn group(&self, scope: &Path, vg: &str) -> Result<Option<VgReport>> {
        self.gateway.lvm(scope).vg_report(vg).await
    }

    async fn group_on_device(&self, scope: &Path, device: &Path) -> Result<Option<String>> {
        Ok(self
            .gateway
            .lvm(scope)
            .pv_report(device)
            .await?
            .map(|pv| pv.vg_name)
            .filter(|name| !name.is_empty()))
    }

    async fn grow_physical(&self, scope: &Path, device: &Path) -> Result<()> {
        self.gateway.lvm(scope).pv_resize(device).await
    }

    async fn create_volume(&self, scope: &Path, vg: &str, lv: &str, bytes: u64) -> Result<PathBuf> {
        self.gateway.lvm(scope).lv_create(vg, lv, bytes).await
    }

    async fn snapshot_volume(
        &self,
        scope: &Path,
        vg: &str,
        origin: &str,
        lv: &str,
        bytes: u64,
        read_only: bool,
    ) -> Result<PathBuf> {
        self.gateway
            .lvm(scope)
            .lv_snapshot(vg, origin, lv, bytes, read_only)
            .await
    }

    async fn remove_volume(&self, scope: &Path, vg: &str, lv: &str) -> Result<()> {
        self.gateway.lvm(scope).lv_remove(vg, lv).await
    }

    async fn resize_volume(
        &self,
        scope: &Path,
        vg: &str,
        lv: &str,
        bytes: u64,
        force: bool,
    ) -> Result<()> {
        self.gateway
            .lvm(scope)
            .lv_resize(vg, lv, bytes, force)
            .await
    }

    async fn set_volume_active(
        &self,
        scope: &Path,
        vg: &str,
        lv: &str,
        active: bool,
    ) -> Result<()> {
        self.gateway.lvm(scope).lv_activate(vg, lv, active).await
    }

    async fn volumes(&self, scope: &Path, vg: &str) -> Result<Vec<LvReport>> {
        self.gateway.lvm(scope).lv_list(vg).await
    }
}
