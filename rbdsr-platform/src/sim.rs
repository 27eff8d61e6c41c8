//! In-memory stand-in for a Ceph cluster, the kernel rbd driver and lvm.
//!
//! `SimulatedCluster` implements `CommandRunner` by interpreting the exact
//! argument lists the clients emit and answering with the same JSON and
//! error text the real tools produce, so the whole stack above the process
//! boundary runs unchanged in tests. Image content is modelled as blocks of
//! `SIM_BLOCK_SIZE` bytes holding one byte value each, which is enough to
//! observe copy-on-write behavior of snapshots and clones.

use crate::command::{CommandOutput, CommandRunner, Tool, ToolInvocation};
use crate::lvm::LVM_SYSTEM_DIR;
use async_trait::async_trait;
use rbdsr_core::{ImageSpec, Result, SrError};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const SIM_BLOCK_SIZE: u64 = 1024 * 1024;

/// lvm's built-in configuration directory, used when no scope is given.
const HOST_LVM_SCOPE: &str = "/etc/lvm";

const VALUE_FLAGS: &[&str] = &[
    "-c",
    "--id",
    "--keyring",
    "-m",
    "--size",
    "--image-format",
    "--image-feature",
    "--format",
    "--reportformat",
    "--units",
    "-o",
    "-n",
    "-L",
    "-p",
];

/// What an injected fault makes the matching invocation return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    Busy,
    Timeout,
    PermissionDenied,
    QuotaExceeded,
    /// Exit status 5 with the given stderr.
    Failure(String),
}

#[derive(Debug)]
struct Fault {
    tool: Tool,
    verb: String,
    remaining: u32,
    kind: FaultKind,
}

#[derive(Debug)]
struct Failure {
    code: i32,
    stderr: String,
}

impl Failure {
    fn errno(code: i32, context: &str, text: &str) -> Self {
        Self {
            code,
            stderr: format!("{context}: ({code}) {text}"),
        }
    }

    fn not_found(context: &str) -> Self {
        Self::errno(2, context, "No such file or directory")
    }

    fn exists(context: &str) -> Self {
        Self::errno(17, context, "File exists")
    }

    fn busy(context: &str) -> Self {
        Self::errno(16, context, "Device or resource busy")
    }

    fn invalid(context: &str) -> Self {
        Self::errno(22, context, "Invalid argument")
    }

    fn raw(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stderr: stderr.into(),
        }
    }

    fn lvm(message: impl Into<String>) -> Self {
        Self::raw(5, format!("  {}", message.into()))
    }
}

type Reply = std::result::Result<String, Failure>;

struct Parsed {
    user: Option<String>,
    positional: Vec<String>,
    flags: BTreeMap<String, Option<String>>,
}

impl Parsed {
    fn parse(args: &[String]) -> Self {
        let mut positional = Vec::new();
        let mut flags = BTreeMap::new();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            if arg.len() > 1 && arg.starts_with('-') {
                let value = if VALUE_FLAGS.contains(&arg.as_str()) {
                    iter.next().cloned()
                } else {
                    None
                };
                flags.insert(arg.clone(), value);
            } else {
                positional.push(arg.clone());
            }
        }

        let user = flags.get("--id").cloned().flatten();
        Self {
            user,
            positional,
            flags,
        }
    }

    fn has(&self, flag: &str) -> bool {
        self.flags.contains_key(flag)
    }

    fn value(&self, flag: &str) -> Option<&str> {
        self.flags.get(flag).and_then(|v| v.as_deref())
    }

    fn arg(&self, idx: usize) -> std::result::Result<&str, Failure> {
        self.positional
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| Failure::invalid("missing argument"))
    }

    fn spec(&self, idx: usize) -> std::result::Result<ImageSpec, Failure> {
        ImageSpec::parse(self.arg(idx)?).map_err(|_| Failure::invalid("bad image spec"))
    }

    fn verb(&self, tool: Tool) -> String {
        let word = |idx: usize| self.positional.get(idx).cloned().unwrap_or_default();
        match tool {
            Tool::Rbd => match word(0).as_str() {
                "snap" | "image-meta" => format!("{} {}", word(0), word(1)),
                _ => word(0),
            },
            Tool::Ceph => match word(0).as_str() {
                "osd" => format!("osd {} {}", word(1), word(2)),
                _ => word(0),
            },
            Tool::Lvm => word(0),
        }
    }
}

#[derive(Debug, Clone)]
struct SimSnapshot {
    size: u64,
    blocks: BTreeMap<u64, u8>,
    protected: bool,
}

#[derive(Debug, Clone, Default)]
struct SimImage {
    size: u64,
    blocks: BTreeMap<u64, u8>,
    snapshots: BTreeMap<String, SimSnapshot>,
    parent: Option<ImageSpec>,
    meta: BTreeMap<String, String>,
    watchers: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct SimPool {
    quota: u64,
    max_avail: u64,
    stored_override: Option<u64>,
    images: BTreeMap<String, SimImage>,
}

impl SimPool {
    fn stored(&self) -> u64 {
        self.stored_override.unwrap_or_else(|| {
            self.images
                .values()
                .map(|image| image.blocks.len() as u64 * SIM_BLOCK_SIZE)
                .sum()
        })
    }
}

#[derive(Debug, Clone)]
struct SimMapping {
    spec: ImageSpec,
    read_only: bool,
    exclusive: bool,
}

#[derive(Debug, Clone)]
struct SimLv {
    size: u64,
    active: bool,
    read_only: bool,
    origin: Option<String>,
}

#[derive(Debug, Clone)]
struct SimVg {
    name: String,
    image: ImageSpec,
    scope: String,
    size: u64,
    active: bool,
    exported: bool,
    lvs: BTreeMap<String, SimLv>,
}

impl SimVg {
    fn free(&self) -> u64 {
        self.size
            .saturating_sub(self.lvs.values().map(|lv| lv.size).sum::<u64>())
    }

    fn is_active(&self) -> bool {
        self.active || self.lvs.values().any(|lv| lv.active)
    }

    fn attr(&self) -> String {
        if self.exported {
            "wzx-n-".to_string()
        } else {
            "wz--n-".to_string()
        }
    }
}

/// Observable state of a simulated volume group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimVolumeGroup {
    pub name: String,
    pub image: ImageSpec,
    pub scope: String,
    pub active: bool,
    pub exported: bool,
    pub logical_volumes: Vec<String>,
}

struct SimState {
    pools: BTreeMap<String, SimPool>,
    mappings: BTreeMap<PathBuf, SimMapping>,
    vgs: Vec<SimVg>,
    faults: Vec<Fault>,
    denied_users: BTreeSet<String>,
    invocations: Vec<ToolInvocation>,
    health: String,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
            mappings: BTreeMap::new(),
            vgs: Vec::new(),
            faults: Vec::new(),
            denied_users: BTreeSet::new(),
            invocations: Vec::new(),
            health: "HEALTH_OK".to_string(),
        }
    }
}

fn parse_rbd_size(text: Option<&str>) -> std::result::Result<u64, Failure> {
    let text = text.ok_or_else(|| Failure::invalid("rbd: must specify --size"))?;
    let mib = text
        .trim_end_matches('M')
        .parse::<u64>()
        .map_err(|_| Failure::invalid("rbd: invalid size"))?;
    Ok(mib * 1024 * 1024)
}

fn parse_lvm_size(text: Option<&str>) -> std::result::Result<u64, Failure> {
    text.and_then(|t| t.trim_end_matches(['b', 'B']).parse::<u64>().ok())
        .ok_or_else(|| Failure::lvm("Invalid size"))
}

fn block_count(size: u64) -> u64 {
    size.div_ceil(SIM_BLOCK_SIZE)
}

fn lv_attr(lv: &SimLv) -> String {
    format!(
        "{}{}i-{}-----",
        if lv.origin.is_some() { 's' } else { '-' },
        if lv.read_only { 'r' } else { 'w' },
        if lv.active { 'a' } else { '-' },
    )
}

fn split_lv(target: &str) -> std::result::Result<(&str, &str), Failure> {
    target
        .split_once('/')
        .ok_or_else(|| Failure::lvm(format!("\"{target}\": Invalid path for Logical Volume.")))
}

impl SimState {
    fn image(&self, spec: &ImageSpec) -> Option<&SimImage> {
        self.pools.get(&spec.pool)?.images.get(&spec.image)
    }

    fn image_mut(&mut self, spec: &ImageSpec) -> std::result::Result<&mut SimImage, Failure> {
        self.pools
            .get_mut(&spec.pool)
            .and_then(|pool| pool.images.get_mut(&spec.image))
            .ok_or_else(|| {
                Failure::not_found(&format!("rbd: error opening image {}", spec.image))
            })
    }

    fn require_image(&self, spec: &ImageSpec) -> std::result::Result<&SimImage, Failure> {
        self.image(spec)
            .ok_or_else(|| Failure::not_found(&format!("rbd: error opening image {}", spec.image)))
    }

    fn require_snapshot(&self, spec: &ImageSpec) -> std::result::Result<&SimSnapshot, Failure> {
        let name = spec.snapshot.as_deref().unwrap_or_default();
        self.require_image(&spec.base())?
            .snapshots
            .get(name)
            .ok_or_else(|| Failure::not_found(&format!("rbd: error setting snapshot context {name}")))
    }

    /// Full content of an image head or snapshot, parent data included.
    fn resolved_blocks(&self, spec: &ImageSpec) -> BTreeMap<u64, u8> {
        if spec.is_snapshot() {
            return self
                .require_snapshot(spec)
                .map(|snap| snap.blocks.clone())
                .unwrap_or_default();
        }

        let Some(image) = self.image(spec) else {
            return BTreeMap::new();
        };

        let limit = block_count(image.size);
        let mut blocks: BTreeMap<u64, u8> = match &image.parent {
            Some(parent) => self
                .resolved_blocks(parent)
                .into_iter()
                .filter(|(block, _)| *block < limit)
                .collect(),
            None => BTreeMap::new(),
        };
        blocks.extend(image.blocks.iter().map(|(k, v)| (*k, *v)));
        blocks
    }

    fn device_for(&self, spec: &ImageSpec) -> Option<PathBuf> {
        self.mappings
            .iter()
            .find(|(_, mapping)| &mapping.spec == spec)
            .map(|(device, _)| device.clone())
    }

    fn next_device(&self) -> PathBuf {
        (0u32..)
            .map(|id| PathBuf::from(format!("/dev/rbd{id}")))
            .find(|device| !self.mappings.contains_key(device))
            .unwrap_or_else(|| PathBuf::from("/dev/rbd-overflow"))
    }

    fn children_of(&self, snap: &ImageSpec) -> Vec<ImageSpec> {
        self.pools
            .iter()
            .flat_map(|(pool, p)| {
                p.images
                    .iter()
                    .filter(|(_, image)| image.parent.as_ref() == Some(snap))
                    .map(move |(name, _)| ImageSpec::image(pool, name))
            })
            .collect()
    }

    fn visible_vg(&self, name: &str, scope: &str) -> Option<usize> {
        self.vgs.iter().position(|vg| {
            vg.name == name && vg.scope == scope && self.device_for(&vg.image).is_some()
        })
    }

    fn require_vg(&self, name: &str, scope: &str) -> std::result::Result<usize, Failure> {
        self.visible_vg(name, scope)
            .ok_or_else(|| Failure::lvm(format!("Volume group \"{name}\" not found")))
    }

    fn take_fault(&mut self, tool: Tool, verb: &str) -> Option<FaultKind> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.tool == tool && f.verb == verb && f.remaining > 0)?;
        let fault = &mut self.faults[idx];
        fault.remaining -= 1;
        let kind = fault.kind.clone();
        if fault.remaining == 0 {
            self.faults.remove(idx);
        }
        Some(kind)
    }

    fn handle_rbd(&mut self, parsed: &Parsed) -> Reply {
        match parsed.verb(Tool::Rbd).as_str() {
            "create" => {
                let spec = parsed.spec(1)?;
                let size = parse_rbd_size(parsed.value("--size"))?;
                let pool = self.pools.get_mut(&spec.pool).ok_or_else(|| {
                    Failure::not_found(&format!("rbd: error opening pool '{}'", spec.pool))
                })?;
                if pool.quota > 0 && pool.stored() >= pool.quota {
                    return Err(Failure::errno(122, "rbd: create error", "Disk quota exceeded"));
                }
                if pool.images.contains_key(&spec.image) {
                    return Err(Failure::exists("rbd: create error"));
                }
                pool.images.insert(
                    spec.image.clone(),
                    SimImage {
                        size,
                        ..SimImage::default()
                    },
                );
                Ok(String::new())
            }
            "rm" => {
                let spec = parsed.spec(1)?;
                let image = self.require_image(&spec)?;
                if !image.snapshots.is_empty() {
                    return Err(Failure::raw(
                        39,
                        "rbd: image has snapshots - these must be deleted with 'rbd snap purge' before the image can be removed.",
                    ));
                }
                if !image.watchers.is_empty() || self.device_for(&spec).is_some() {
                    return Err(Failure::raw(
                        16,
                        "rbd: error: image still has watchers\nThis means the image is still open or the client using it crashed.",
                    ));
                }
                if let Some(pool) = self.pools.get_mut(&spec.pool) {
                    pool.images.remove(&spec.image);
                }
                self.vgs.retain(|vg| vg.image != spec);
                Ok(String::new())
            }
            "resize" => {
                let spec = parsed.spec(1)?;
                let size = parse_rbd_size(parsed.value("--size"))?;
                let allow_shrink = parsed.has("--allow-shrink");
                let image = self.image_mut(&spec)?;
                if size < image.size && !allow_shrink {
                    return Err(Failure::raw(
                        22,
                        "rbd: shrinking an image is only allowed with the --allow-shrink flag",
                    ));
                }
                image.size = size;
                let limit = block_count(size);
                image.blocks.retain(|block, _| *block < limit);
                Ok(String::new())
            }
            "info" => {
                let spec = parsed.spec(1)?;
                let (size, parent) = if spec.is_snapshot() {
                    (self.require_snapshot(&spec)?.size, None)
                } else {
                    let image = self.require_image(&spec)?;
                    (image.size, image.parent.clone())
                };
                let mut info = json!({ "name": spec.image, "size": size, "format": 2 });
                if let Some(parent) = parent {
                    info["parent"] = json!({
                        "pool": parent.pool,
                        "image": parent.image,
                        "snapshot": parent.snapshot,
                    });
                }
                Ok(info.to_string())
            }
            "du" => {
                let spec = parsed.spec(1)?;
                let image = self.require_image(&spec)?;
                let used = (image.blocks.len() as u64 * SIM_BLOCK_SIZE).min(image.size);
                let mut entries: Vec<Value> = image
                    .snapshots
                    .iter()
                    .map(|(name, snap)| {
                        json!({
                            "name": spec.image,
                            "snapshot": name,
                            "provisioned_size": snap.size,
                            "used_size": 0,
                        })
                    })
                    .collect();
                entries.push(json!({
                    "name": spec.image,
                    "provisioned_size": image.size,
                    "used_size": used,
                }));
                Ok(json!({
                    "images": entries,
                    "total_provisioned_size": image.size,
                    "total_used_size": used,
                })
                .to_string())
            }
            "ls" => {
                let pool_name = parsed.arg(1)?;
                let pool = self.pools.get(pool_name).ok_or_else(|| {
                    Failure::not_found(&format!("rbd: error opening pool '{pool_name}'"))
                })?;
                let mut rows = Vec::new();
                for (name, image) in &pool.images {
                    let mut row = json!({ "image": name, "size": image.size, "format": 2 });
                    if let Some(parent) = &image.parent {
                        row["parent"] = json!({
                            "pool": parent.pool,
                            "image": parent.image,
                            "snapshot": parent.snapshot,
                        });
                    }
                    rows.push(row);
                    for (snap_name, snap) in &image.snapshots {
                        rows.push(json!({
                            "image": name,
                            "snapshot": snap_name,
                            "size": snap.size,
                            "protected": if snap.protected { "true" } else { "false" },
                            "format": 2,
                        }));
                    }
                }
                Ok(Value::Array(rows).to_string())
            }
            "map" => {
                let spec = parsed.spec(1)?;
                if spec.is_snapshot() {
                    self.require_snapshot(&spec)?;
                } else {
                    self.require_image(&spec)?;
                }
                let exclusive = parsed.has("--exclusive");
                let held_exclusively = self
                    .mappings
                    .values()
                    .any(|m| m.spec == spec && (m.exclusive || exclusive));
                if held_exclusively {
                    return Err(Failure::busy("rbd: sysfs write failed\nrbd: map failed"));
                }
                let device = self.next_device();
                self.mappings.insert(
                    device.clone(),
                    SimMapping {
                        read_only: parsed.has("--read-only") || spec.is_snapshot(),
                        spec,
                        exclusive,
                    },
                );
                Ok(format!("{}\n", device.display()))
            }
            "unmap" => {
                let device = PathBuf::from(parsed.arg(1)?);
                let mapping = self.mappings.get(&device).ok_or_else(|| {
                    Failure::raw(
                        22,
                        format!("rbd: {}: not a mapped image or snapshot", device.display()),
                    )
                })?;
                let spec = mapping.spec.clone();
                let others = self
                    .mappings
                    .iter()
                    .filter(|(d, m)| m.spec == spec && **d != device)
                    .count();
                if others == 0 && self.vgs.iter().any(|vg| vg.image == spec && vg.is_active()) {
                    return Err(Failure::busy("rbd: sysfs write failed\nrbd: unmap failed"));
                }
                self.mappings.remove(&device);
                Ok(String::new())
            }
            "showmapped" => {
                let rows: Vec<Value> = self
                    .mappings
                    .iter()
                    .enumerate()
                    .map(|(id, (device, mapping))| {
                        json!({
                            "id": id.to_string(),
                            "pool": mapping.spec.pool,
                            "namespace": "",
                            "name": mapping.spec.image,
                            "snap": mapping.spec.snapshot.clone().unwrap_or_else(|| "-".to_string()),
                            "device": device,
                        })
                    })
                    .collect();
                Ok(Value::Array(rows).to_string())
            }
            "status" => {
                let spec = parsed.spec(1)?;
                let image = self.require_image(&spec)?;
                let mut watchers: Vec<Value> = image
                    .watchers
                    .iter()
                    .map(|address| json!({ "address": address }))
                    .collect();
                for device in self
                    .mappings
                    .iter()
                    .filter(|(_, m)| m.spec == spec)
                    .map(|(d, _)| d)
                {
                    watchers.push(json!({ "address": format!("127.0.0.1:0/{}", device.display()) }));
                }
                Ok(json!({ "watchers": watchers }).to_string())
            }
            "snap create" => {
                let spec = parsed.spec(2)?;
                let name = spec
                    .snapshot
                    .clone()
                    .ok_or_else(|| Failure::invalid("rbd: snapshot name was not specified"))?;
                let base = spec.base();
                let blocks = self.resolved_blocks(&base);
                let image = self.image_mut(&base)?;
                if image.snapshots.contains_key(&name) {
                    return Err(Failure::exists("rbd: failed to create snapshot"));
                }
                let size = image.size;
                image.snapshots.insert(
                    name,
                    SimSnapshot {
                        size,
                        blocks,
                        protected: false,
                    },
                );
                Ok(String::new())
            }
            "snap protect" => {
                let spec = parsed.spec(2)?;
                if self.require_snapshot(&spec)?.protected {
                    return Err(Failure::busy("rbd: protecting snap failed"));
                }
                self.set_protected(&spec, true)
            }
            "snap unprotect" => {
                let spec = parsed.spec(2)?;
                if !self.require_snapshot(&spec)?.protected {
                    return Err(Failure::invalid("rbd: unprotecting snap failed"));
                }
                if !self.children_of(&spec).is_empty() {
                    return Err(Failure::busy("rbd: unprotecting snap failed"));
                }
                self.set_protected(&spec, false)
            }
            "snap rm" => {
                let spec = parsed.spec(2)?;
                let name = spec.snapshot.clone().unwrap_or_default();
                if self.require_snapshot(&spec)?.protected {
                    return Err(Failure::raw(
                        16,
                        format!("rbd: snapshot '{name}' is protected from removal."),
                    ));
                }
                self.image_mut(&spec.base())?.snapshots.remove(&name);
                Ok(String::new())
            }
            "snap ls" => {
                let spec = parsed.spec(2)?;
                let image = self.require_image(&spec)?;
                let rows: Vec<Value> = image
                    .snapshots
                    .iter()
                    .enumerate()
                    .map(|(id, (name, snap))| {
                        json!({
                            "id": id + 1,
                            "name": name,
                            "size": snap.size,
                            "protected": if snap.protected { "true" } else { "false" },
                        })
                    })
                    .collect();
                Ok(Value::Array(rows).to_string())
            }
            "snap purge" => {
                let spec = parsed.spec(2)?;
                let image = self.image_mut(&spec)?;
                if image.snapshots.values().any(|snap| snap.protected) {
                    return Err(Failure::busy("rbd: removing snaps failed"));
                }
                image.snapshots.clear();
                Ok(String::new())
            }
            "children" => {
                let spec = parsed.spec(1)?;
                self.require_snapshot(&spec)?;
                let rows: Vec<Value> = self
                    .children_of(&spec)
                    .into_iter()
                    .map(|child| {
                        json!({ "pool": child.pool, "pool_namespace": "", "image": child.image })
                    })
                    .collect();
                Ok(Value::Array(rows).to_string())
            }
            "clone" => {
                let source = parsed.spec(1)?;
                let dest = parsed.spec(2)?;
                let snap = self.require_snapshot(&source)?;
                if !snap.protected {
                    return Err(Failure::errno(
                        22,
                        "rbd: clone error: parent snapshot must be protected",
                        "Invalid argument",
                    ));
                }
                let size = snap.size;
                let pool = self.pools.get_mut(&dest.pool).ok_or_else(|| {
                    Failure::not_found(&format!("rbd: error opening pool '{}'", dest.pool))
                })?;
                if pool.images.contains_key(&dest.image) {
                    return Err(Failure::exists("rbd: clone error"));
                }
                pool.images.insert(
                    dest.image.clone(),
                    SimImage {
                        size,
                        parent: Some(source),
                        ..SimImage::default()
                    },
                );
                Ok(String::new())
            }
            "flatten" => {
                let spec = parsed.spec(1)?;
                self.require_image(&spec)?;
                let blocks = self.resolved_blocks(&spec);
                let image = self.image_mut(&spec)?;
                image.blocks = blocks;
                image.parent = None;
                Ok(String::new())
            }
            "image-meta get" => {
                let spec = parsed.spec(2)?;
                let key = parsed.arg(3)?;
                self.require_image(&spec)?
                    .meta
                    .get(key)
                    .map(|value| format!("{value}\n"))
                    .ok_or_else(|| {
                        Failure::not_found(&format!("failed to get metadata {key} of image"))
                    })
            }
            "image-meta set" => {
                let spec = parsed.spec(2)?;
                let key = parsed.arg(3)?.to_string();
                let value = parsed.arg(4)?.to_string();
                self.image_mut(&spec)?.meta.insert(key, value);
                Ok(String::new())
            }
            other => Err(Failure::invalid(&format!("rbd: unknown command '{other}'"))),
        }
    }

    fn set_protected(&mut self, spec: &ImageSpec, protected: bool) -> Reply {
        let name = spec.snapshot.clone().unwrap_or_default();
        if let Some(snap) = self.image_mut(&spec.base())?.snapshots.get_mut(&name) {
            snap.protected = protected;
        }
        Ok(String::new())
    }

    fn require_pool(&self, name: &str) -> std::result::Result<&SimPool, Failure> {
        self.pools
            .get(name)
            .ok_or_else(|| Failure::raw(2, format!("Error ENOENT: unrecognized pool '{name}'")))
    }

    fn handle_ceph(&mut self, parsed: &Parsed) -> Reply {
        match parsed.verb(Tool::Ceph).as_str() {
            "health" => Ok(format!("{}\n", self.health)),
            "osd pool ls" => Ok(json!(self.pools.keys().collect::<Vec<_>>()).to_string()),
            "osd pool stats" => {
                let name = parsed.arg(3)?;
                self.require_pool(name)?;
                Ok(json!([{ "pool_name": name, "recovery": {}, "client_io_rate": {} }]).to_string())
            }
            "osd pool get-quota" => {
                let name = parsed.arg(3)?;
                let pool = self.require_pool(name)?;
                Ok(json!({
                    "pool_name": name,
                    "quota_max_objects": 0,
                    "quota_max_bytes": pool.quota,
                    "current_num_objects": 0,
                    "current_num_bytes": pool.stored(),
                })
                .to_string())
            }
            "osd pool set-quota" => {
                let name = parsed.arg(3)?.to_string();
                let value = parsed
                    .arg(5)?
                    .parse::<u64>()
                    .map_err(|_| Failure::raw(22, "Error EINVAL: invalid quota value"))?;
                self.require_pool(&name)?;
                if let Some(pool) = self.pools.get_mut(&name) {
                    pool.quota = value;
                }
                Ok(format!("set-quota max_bytes = {value} for pool {name}\n"))
            }
            "df" => {
                let pools: Vec<Value> = self
                    .pools
                    .iter()
                    .enumerate()
                    .map(|(id, (name, pool))| {
                        json!({
                            "name": name,
                            "id": id + 1,
                            "stats": {
                                "stored": pool.stored(),
                                "bytes_used": pool.stored() * 3,
                                "max_avail": pool.max_avail,
                                "quota_bytes": pool.quota,
                            },
                        })
                    })
                    .collect();
                Ok(json!({ "stats": {}, "pools": pools }).to_string())
            }
            other => Err(Failure::raw(22, format!("Error EINVAL: unknown command '{other}'"))),
        }
    }

    fn handle_lvm(&mut self, parsed: &Parsed, scope: &str) -> Reply {
        match parsed.verb(Tool::Lvm).as_str() {
            "vgcreate" => {
                let name = parsed.arg(1)?.to_string();
                let device = PathBuf::from(parsed.arg(2)?);
                let mapping = self
                    .mappings
                    .get(&device)
                    .cloned()
                    .ok_or_else(|| Failure::lvm(format!("Device {} not found.", device.display())))?;
                if self.visible_vg(&name, scope).is_some() {
                    return Err(Failure::lvm(format!(
                        "A volume group called {name} already exists."
                    )));
                }
                if let Some(other) = self.vgs.iter().find(|vg| vg.image == mapping.spec) {
                    return Err(Failure::lvm(format!(
                        "Physical volume '{}' is already in volume group '{}'",
                        device.display(),
                        other.name
                    )));
                }
                let size = self.require_image(&mapping.spec)?.size;
                self.vgs.push(SimVg {
                    name,
                    image: mapping.spec,
                    scope: scope.to_string(),
                    size,
                    active: true,
                    exported: false,
                    lvs: BTreeMap::new(),
                });
                Ok(String::new())
            }
            "vgremove" => {
                let idx = self.require_vg(parsed.arg(1)?, scope)?;
                self.vgs.remove(idx);
                Ok(String::new())
            }
            "vgchange" => {
                let name = parsed.arg(1)?;
                let idx = self.require_vg(name, scope)?;
                let vg = &mut self.vgs[idx];
                let active = parsed.has("-ay");
                if active && vg.exported {
                    return Err(Failure::lvm(format!("Volume group \"{name}\" is exported")));
                }
                vg.active = active;
                for lv in vg.lvs.values_mut() {
                    lv.active = active;
                }
                Ok(String::new())
            }
            "vgexport" => {
                let name = parsed.arg(1)?;
                let idx = self.require_vg(name, scope)?;
                let vg = &mut self.vgs[idx];
                if vg.is_active() {
                    return Err(Failure::lvm(format!(
                        "Volume group \"{name}\" has active logical volumes"
                    )));
                }
                vg.exported = true;
                Ok(String::new())
            }
            "vgimport" => {
                let idx = self.require_vg(parsed.arg(1)?, scope)?;
                self.vgs[idx].exported = false;
                Ok(String::new())
            }
            "vgs" => {
                let rows: Vec<Value> = match parsed.positional.get(1) {
                    Some(name) => {
                        let idx = self.require_vg(name, scope)?;
                        vec![self.vg_row(idx)]
                    }
                    None => (0..self.vgs.len())
                        .filter(|idx| {
                            let vg = &self.vgs[*idx];
                            vg.scope == scope && self.device_for(&vg.image).is_some()
                        })
                        .map(|idx| self.vg_row(idx))
                        .collect(),
                };
                Ok(json!({ "report": [{ "vg": rows }] }).to_string())
            }
            "pvs" => {
                let device = PathBuf::from(parsed.arg(1)?);
                let not_found = || {
                    Failure::lvm(format!(
                        "Failed to find physical volume \"{}\".",
                        device.display()
                    ))
                };
                let mapping = self.mappings.get(&device).ok_or_else(not_found)?;
                // PV labels live on the device, so any scope whose filter admits it sees them.
                let vg = self
                    .vgs
                    .iter()
                    .find(|vg| vg.image == mapping.spec)
                    .ok_or_else(not_found)?;
                Ok(json!({ "report": [{ "pv": [{
                    "pv_name": device,
                    "pv_size": vg.size.to_string(),
                    "vg_name": vg.name,
                }] }] })
                .to_string())
            }
            "pvresize" => {
                let device = PathBuf::from(parsed.arg(1)?);
                let spec = self
                    .mappings
                    .get(&device)
                    .map(|m| m.spec.clone())
                    .ok_or_else(|| Failure::lvm(format!("Device {} not found.", device.display())))?;
                let size = self.require_image(&spec)?.size;
                let vg = self
                    .vgs
                    .iter_mut()
                    .find(|vg| vg.image == spec && vg.scope == scope)
                    .ok_or_else(|| {
                        Failure::lvm(format!(
                            "Failed to find physical volume \"{}\".",
                            device.display()
                        ))
                    })?;
                vg.size = size;
                Ok(String::new())
            }
            "lvcreate" => {
                let name = parsed
                    .value("-n")
                    .ok_or_else(|| Failure::lvm("Please specify a logical volume name."))?
                    .to_string();
                let size = parse_lvm_size(parsed.value("-L"))?;
                let target = parsed.arg(1)?;
                let (vg_name, origin) = match target.split_once('/') {
                    Some((vg, origin)) => (vg, Some(origin.to_string())),
                    None => (target, None),
                };
                let idx = self.require_vg(vg_name, scope)?;
                let vg = &mut self.vgs[idx];
                if vg.exported {
                    return Err(Failure::lvm(format!("Volume group \"{vg_name}\" is exported")));
                }
                if vg.lvs.contains_key(&name) {
                    return Err(Failure::lvm(format!(
                        "Logical Volume \"{name}\" already exists in volume group \"{vg_name}\""
                    )));
                }
                if parsed.has("-s") {
                    let origin_name = origin
                        .clone()
                        .ok_or_else(|| Failure::lvm("Snapshots need an origin volume."))?;
                    if !vg.lvs.contains_key(&origin_name) {
                        return Err(Failure::lvm(format!(
                            "Failed to find logical volume \"{vg_name}/{origin_name}\""
                        )));
                    }
                }
                if size > vg.free() {
                    return Err(Failure::lvm(format!(
                        "Volume group \"{vg_name}\" has insufficient free space"
                    )));
                }
                vg.active = true;
                vg.lvs.insert(
                    name,
                    SimLv {
                        size,
                        active: true,
                        read_only: parsed.value("-p") == Some("r"),
                        origin: if parsed.has("-s") { origin } else { None },
                    },
                );
                Ok(String::new())
            }
            "lvremove" => {
                let (vg_name, lv_name) = split_lv(parsed.arg(1)?)?;
                let idx = self.require_vg(vg_name, scope)?;
                let vg = &mut self.vgs[idx];
                if vg.lvs.remove(lv_name).is_none() {
                    return Err(Failure::lvm(format!(
                        "Failed to find logical volume \"{vg_name}/{lv_name}\""
                    )));
                }
                vg.lvs
                    .retain(|_, lv| lv.origin.as_deref() != Some(lv_name));
                Ok(String::new())
            }
            "lvresize" => {
                let (vg_name, lv_name) = split_lv(parsed.arg(1)?)?;
                let size = parse_lvm_size(parsed.value("-L"))?;
                let force = parsed.has("-f");
                let idx = self.require_vg(vg_name, scope)?;
                let vg = &mut self.vgs[idx];
                let free = vg.free();
                let lv = vg.lvs.get_mut(lv_name).ok_or_else(|| {
                    Failure::lvm(format!(
                        "Failed to find logical volume \"{vg_name}/{lv_name}\""
                    ))
                })?;
                if size < lv.size && !force {
                    return Err(Failure::lvm("Logical volume reduce cancelled."));
                }
                if size > lv.size && size - lv.size > free {
                    return Err(Failure::lvm(format!(
                        "Volume group \"{vg_name}\" has insufficient free space"
                    )));
                }
                lv.size = size;
                Ok(String::new())
            }
            "lvchange" => {
                let (vg_name, lv_name) = split_lv(parsed.arg(1)?)?;
                let active = parsed.has("-ay");
                let idx = self.require_vg(vg_name, scope)?;
                let vg = &mut self.vgs[idx];
                let lv = vg.lvs.get_mut(lv_name).ok_or_else(|| {
                    Failure::lvm(format!(
                        "Failed to find logical volume \"{vg_name}/{lv_name}\""
                    ))
                })?;
                lv.active = active;
                if active {
                    vg.active = true;
                }
                Ok(String::new())
            }
            "lvs" => {
                let idx = self.require_vg(parsed.arg(1)?, scope)?;
                let rows: Vec<Value> = self.vgs[idx]
                    .lvs
                    .iter()
                    .map(|(name, lv)| {
                        json!({
                            "lv_name": name,
                            "lv_size": lv.size.to_string(),
                            "lv_attr": lv_attr(lv),
                            "origin": lv.origin.clone().unwrap_or_default(),
                        })
                    })
                    .collect();
                Ok(json!({ "report": [{ "lv": rows }] }).to_string())
            }
            other => Err(Failure::lvm(format!("No such command '{other}'."))),
        }
    }

    fn vg_row(&self, idx: usize) -> Value {
        let vg = &self.vgs[idx];
        json!({
            "vg_name": vg.name,
            "vg_size": vg.size.to_string(),
            "vg_free": vg.free().to_string(),
            "vg_attr": vg.attr(),
        })
    }
}

/// Simulated cluster, kernel and volume manager behind a `CommandRunner`.
#[derive(Default)]
pub struct SimulatedCluster {
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_pool(&self, name: &str, max_avail: u64) {
        self.state.lock().await.pools.insert(
            name.to_string(),
            SimPool {
                max_avail,
                ..SimPool::default()
            },
        );
    }

    pub async fn set_quota(&self, pool: &str, bytes: u64) {
        if let Some(pool) = self.state.lock().await.pools.get_mut(pool) {
            pool.quota = bytes;
        }
    }

    /// Pin the pool's reported stored bytes instead of deriving them from written blocks.
    pub async fn set_stored(&self, pool: &str, bytes: Option<u64>) {
        if let Some(pool) = self.state.lock().await.pools.get_mut(pool) {
            pool.stored_override = bytes;
        }
    }

    pub async fn set_health(&self, health: &str) {
        self.state.lock().await.health = health.to_string();
    }

    /// Reject every rbd and ceph invocation authenticating as `user`.
    pub async fn deny_user(&self, user: &str) {
        self.state.lock().await.denied_users.insert(user.to_string());
    }

    /// Make the next `times` invocations of `verb` (e.g. `map`, `snap protect`,
    /// `vgchange`, `osd pool stats`) fail with `kind`.
    pub async fn inject_fault(&self, tool: Tool, verb: &str, times: u32, kind: FaultKind) {
        self.state.lock().await.faults.push(Fault {
            tool,
            verb: verb.to_string(),
            remaining: times,
            kind,
        });
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Register an extra client watch, as a VM on another host would hold.
    pub async fn add_watcher(&self, spec: &ImageSpec, address: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .image_mut(spec)
            .map_err(|_| not_found(spec))?
            .watchers
            .push(address.to_string());
        Ok(())
    }

    /// Map an image behind the driver's back, as a crashed process would leave it.
    pub async fn add_kernel_mapping(&self, spec: &ImageSpec) -> Result<PathBuf> {
        let mut state = self.state.lock().await;
        if state.image(&spec.base()).is_none() {
            return Err(not_found(spec));
        }
        let device = state.next_device();
        state.mappings.insert(
            device.clone(),
            SimMapping {
                spec: spec.clone(),
                read_only: spec.is_snapshot(),
                exclusive: false,
            },
        );
        Ok(device)
    }

    pub async fn write_block(&self, spec: &ImageSpec, block: u64, value: u8) -> Result<()> {
        let mut state = self.state.lock().await;
        let image = state.image_mut(spec).map_err(|_| not_found(spec))?;
        if block >= block_count(image.size) {
            return Err(SrError::Unknown {
                operation: "write".to_string(),
                target: spec.to_string(),
                detail: format!("block {block} beyond end of image"),
            });
        }
        image.blocks.insert(block, value);
        Ok(())
    }

    /// Content of one block of an image head or snapshot; unwritten blocks read as zero.
    pub async fn read_block(&self, spec: &ImageSpec, block: u64) -> Result<u8> {
        let state = self.state.lock().await;
        if spec.is_snapshot() {
            state.require_snapshot(spec).map_err(|_| not_found(spec))?;
        } else {
            state.require_image(spec).map_err(|_| not_found(spec))?;
        }
        Ok(state
            .resolved_blocks(spec)
            .get(&block)
            .copied()
            .unwrap_or_default())
    }

    pub async fn image_names(&self, pool: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .pools
            .get(pool)
            .map(|p| p.images.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn image_size(&self, spec: &ImageSpec) -> Option<u64> {
        self.state.lock().await.image(spec).map(|image| image.size)
    }

    pub async fn image_parent(&self, spec: &ImageSpec) -> Option<ImageSpec> {
        self.state.lock().await.image(spec)?.parent.clone()
    }

    pub async fn image_meta(&self, spec: &ImageSpec, key: &str) -> Option<String> {
        self.state.lock().await.image(spec)?.meta.get(key).cloned()
    }

    pub async fn snapshot_names(&self, spec: &ImageSpec) -> Vec<String> {
        self.state
            .lock()
            .await
            .image(spec)
            .map(|image| image.snapshots.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_protected(&self, spec: &ImageSpec) -> bool {
        self.state
            .lock()
            .await
            .require_snapshot(spec)
            .map(|snap| snap.protected)
            .unwrap_or(false)
    }

    /// Live kernel mappings, device to image.
    pub async fn mapped(&self) -> Vec<(PathBuf, ImageSpec)> {
        self.state
            .lock()
            .await
            .mappings
            .iter()
            .map(|(device, mapping)| (device.clone(), mapping.spec.clone()))
            .collect()
    }

    pub async fn is_read_only_mapping(&self, device: &Path) -> bool {
        self.state
            .lock()
            .await
            .mappings
            .get(device)
            .map(|m| m.read_only)
            .unwrap_or(false)
    }

    pub async fn volume_groups(&self) -> Vec<SimVolumeGroup> {
        self.state
            .lock()
            .await
            .vgs
            .iter()
            .map(|vg| SimVolumeGroup {
                name: vg.name.clone(),
                image: vg.image.clone(),
                scope: vg.scope.clone(),
                active: vg.is_active(),
                exported: vg.exported,
                logical_volumes: vg.lvs.keys().cloned().collect(),
            })
            .collect()
    }

    pub async fn invocations(&self) -> Vec<ToolInvocation> {
        self.state.lock().await.invocations.clone()
    }

    /// How many times `verb` was issued to `tool`, failed attempts included.
    pub async fn count(&self, tool: Tool, verb: &str) -> usize {
        self.state
            .lock()
            .await
            .invocations
            .iter()
            .filter(|inv| inv.tool == tool && Parsed::parse(&inv.args).verb(tool) == verb)
            .count()
    }
}

fn not_found(spec: &ImageSpec) -> SrError {
    SrError::NotFound {
        resource: spec.to_string(),
    }
}

#[async_trait]
impl CommandRunner for SimulatedCluster {
    async fn run(&self, invocation: &ToolInvocation) -> Result<CommandOutput> {
        let mut state = self.state.lock().await;
        state.invocations.push(invocation.clone());

        let parsed = Parsed::parse(&invocation.args);
        let tool = invocation.tool;

        if let Some(kind) = state.take_fault(tool, &parsed.verb(tool)) {
            let failure = match kind {
                FaultKind::Timeout => return Ok(CommandOutput::timed_out()),
                FaultKind::Busy => Failure::busy("injected"),
                FaultKind::PermissionDenied => Failure::errno(13, "injected", "Permission denied"),
                FaultKind::QuotaExceeded => Failure::errno(122, "injected", "Disk quota exceeded"),
                FaultKind::Failure(stderr) => Failure::raw(5, stderr),
            };
            return Ok(CommandOutput::from_process(
                tool,
                Some(failure.code),
                String::new(),
                failure.stderr,
            ));
        }

        let denied = tool != Tool::Lvm
            && parsed
                .user
                .as_ref()
                .is_some_and(|user| state.denied_users.contains(user));

        let reply = if denied {
            Err(Failure::errno(
                13,
                "monclient(hunting): handle_auth_bad_method server allowed_methods [2] but i only support [2]",
                "Permission denied",
            ))
        } else {
            match tool {
                Tool::Rbd => state.handle_rbd(&parsed),
                Tool::Ceph => state.handle_ceph(&parsed),
                Tool::Lvm => {
                    let scope = invocation
                        .env_var(LVM_SYSTEM_DIR)
                        .unwrap_or(HOST_LVM_SCOPE)
                        .to_string();
                    state.handle_lvm(&parsed, &scope)
                }
            }
        };

        Ok(match reply {
            Ok(stdout) => CommandOutput::success(stdout),
            Err(failure) => {
                CommandOutput::from_process(tool, Some(failure.code), String::new(), failure.stderr)
            }
        })
    }
}
