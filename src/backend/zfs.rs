use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::backend::{Capabilities, DiffSource, GraphBackend};
use crate::config::{BackendKind, ZfsConfig};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::ZFS_CONTROL_DIR;
use crate::id::FilesystemId;
use crate::ops::diff::diff_candidates;
use crate::types::{Changeset, SnapshotRef};

/// name of the single snapshot each dataset carries
const SNAPSHOT_NAME: &str = "frozen";

/// user property marking a dataset tree as ours
const MANAGED_PROPERTY: &str = "ocigraph:managed";

/// captured result of one `zfs`/`zpool` invocation
#[derive(Clone, Debug, Default)]
pub struct ZfsOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// runs `zfs` and `zpool` subcommands
pub trait ZfsCommand: Send + Sync {
    fn zfs(&self, args: &[&str]) -> Result<ZfsOutput>;
    fn zpool(&self, args: &[&str]) -> Result<ZfsOutput>;
}

/// spawns the real binaries
pub struct SystemZfs {
    zfs_bin: PathBuf,
    zpool_bin: PathBuf,
}

impl SystemZfs {
    pub fn new(config: &ZfsConfig) -> Self {
        Self {
            zfs_bin: config.zfs_bin.clone(),
            zpool_bin: config.zpool_bin.clone(),
        }
    }

    fn run(bin: &Path, args: &[&str]) -> Result<ZfsOutput> {
        let output = Command::new(bin).args(args).output().map_err(|e| {
            Error::BackendUnavailable(format!("cannot run {}: {}", bin.display(), e))
        })?;
        Ok(ZfsOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl ZfsCommand for SystemZfs {
    fn zfs(&self, args: &[&str]) -> Result<ZfsOutput> {
        Self::run(&self.zfs_bin, args)
    }

    fn zpool(&self, args: &[&str]) -> Result<ZfsOutput> {
        Self::run(&self.zpool_bin, args)
    }
}

/// one line of `zfs diff -H -F`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZfsDiffLine {
    /// `+`, `-`, `M` or `R`
    pub change: char,
    /// `F`, `/`, `@`, `|`, `=`, `B`, `C`, ...
    pub file_type: char,
    pub path: String,
    /// rename target, for `R` lines
    pub new_path: Option<String>,
}

/// parse `zfs diff -H -F` output, decoding `\NNNN` octal escapes in paths
pub fn parse_zfs_diff(output: &str) -> Result<Vec<ZfsDiffLine>> {
    let mut lines = Vec::new();
    for line in output.lines().filter(|l| !l.is_empty()) {
        let bad = || Error::backend("diff", "zfs diff output", format!("unparseable line: {:?}", line));
        let mut fields = line.split('\t');
        let change = single_char(fields.next()).ok_or_else(bad)?;
        let file_type = single_char(fields.next()).ok_or_else(bad)?;
        let path = fields.next().map(decode_escapes).ok_or_else(bad)?;
        let new_path = fields.next().map(decode_escapes);
        if !matches!(change, '+' | '-' | 'M' | 'R') || (change == 'R') != new_path.is_some() {
            return Err(bad());
        }
        lines.push(ZfsDiffLine {
            change,
            file_type,
            path,
            new_path,
        });
    }
    Ok(lines)
}

fn single_char(field: Option<&str>) -> Option<char> {
    let mut chars = field?.chars();
    let c = chars.next()?;
    chars.next().is_none().then_some(c)
}

fn decode_escapes(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 5);
        if bytes[i] == b'\\' && octal.is_some_and(|o| o.iter().all(|b| (b'0'..=b'7').contains(b))) {
            let value = bytes[i + 1..i + 5]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 5;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// backend over zfs datasets, snapshots and clones
///
/// every filesystem is the dataset `<dataset>/<id>`, mounted at
/// `<mount_base>/<id>` on demand, frozen as `<dataset>/<id>@frozen`.
pub struct ZfsBackend {
    config: ZfsConfig,
    mount_base: PathBuf,
    cmd: Box<dyn ZfsCommand>,
}

impl ZfsBackend {
    pub fn new(config: ZfsConfig, mount_base: PathBuf, cmd: Box<dyn ZfsCommand>) -> Self {
        Self {
            config,
            mount_base,
            cmd,
        }
    }

    fn pool(&self) -> &str {
        self.config
            .dataset
            .split('/')
            .next()
            .unwrap_or(&self.config.dataset)
    }

    fn dataset(&self, id: &FilesystemId) -> String {
        format!("{}/{}", self.config.dataset, id)
    }

    fn snapshot(&self, id: &FilesystemId) -> String {
        format!("{}@{}", self.dataset(id), SNAPSHOT_NAME)
    }

    fn mountpoint(&self, id: &FilesystemId) -> PathBuf {
        self.mount_base.join(id.as_str())
    }

    /// run `zfs`, turning a failed exit into a backend error on `target`
    fn zfs(&self, op: &'static str, target: &str, args: &[&str]) -> Result<String> {
        let out = self.cmd.zfs(args)?;
        if !out.success {
            return Err(Error::backend(op, target, out.stderr.trim()));
        }
        Ok(out.stdout)
    }

    fn target_exists(&self, target: &str) -> Result<bool> {
        Ok(self.cmd.zfs(&["list", "-H", "-o", "name", target])?.success)
    }

    fn property(&self, target: &str, property: &str) -> Result<String> {
        let out = self.zfs("get", target, &["get", "-H", "-o", "value", property, target])?;
        Ok(out.trim().to_string())
    }

    fn is_mounted(&self, id: &FilesystemId) -> Result<bool> {
        Ok(self.property(&self.dataset(id), "mounted")? == "yes")
    }

    /// datasets cloned from `id`'s snapshot
    fn clones(&self, id: &FilesystemId) -> Result<Vec<String>> {
        let snapshot = self.snapshot(id);
        if !self.target_exists(&snapshot)? {
            return Ok(Vec::new());
        }
        let value = self.property(&snapshot, "clones")?;
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty() && *c != "-")
            .map(str::to_string)
            .collect())
    }

    fn validate_pool(&self) -> Result<()> {
        let pool = self.pool();
        let out = self.cmd.zpool(&["list", "-H", "-o", "name,health", pool])?;
        if !out.success {
            return Err(Error::BackendUnavailable(format!(
                "zfs pool {} not found: {}",
                pool,
                out.stderr.trim()
            )));
        }
        let line = out.stdout.lines().next().unwrap_or_default();
        let mut fields = line.split('\t');
        match (fields.next(), fields.next()) {
            (Some(name), Some("ONLINE")) if name == pool => Ok(()),
            (Some(name), Some(health)) if name == pool => Err(Error::BackendUnavailable(format!(
                "zfs pool {} is {}",
                pool, health
            ))),
            _ => Err(Error::BackendUnavailable(format!(
                "zfs pool {} not listed by zpool",
                pool
            ))),
        }
    }

    /// path of a tree inside the mountpoint-relative output of `zfs diff`
    fn relative_path(&self, id: &FilesystemId, path: &str) -> Option<String> {
        let mountpoint = self.mountpoint(id);
        let snapshot_dir = mountpoint.join(ZFS_CONTROL_DIR).join("snapshot").join(SNAPSHOT_NAME);
        let path = Path::new(path);
        let rel = path
            .strip_prefix(&snapshot_dir)
            .or_else(|_| path.strip_prefix(&mountpoint))
            .ok()?;
        Some(format!("/{}", rel.to_string_lossy()))
    }
}

impl GraphBackend for ZfsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Zfs
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_diff: self.config.native_diff,
        }
    }

    fn prepare(&self) -> Result<()> {
        self.validate_pool()?;
        let dataset = self.config.dataset.as_str();
        if !self.target_exists(dataset)? {
            self.zfs("create", dataset, &["create", "-p", "-o", "canmount=off", dataset])?;
        }
        let managed = format!("{}=on", MANAGED_PROPERTY);
        self.zfs("set", dataset, &["set", &managed, dataset])?;
        fs::create_dir_all(&self.mount_base).with_path(&self.mount_base)?;
        info!(dataset, "prepared zfs dataset");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.validate_pool()?;
        let dataset = self.config.dataset.as_str();
        let unavailable = |why: &str| {
            Error::BackendUnavailable(format!("zfs dataset {} {}", dataset, why))
        };
        if !self.target_exists(dataset)? {
            return Err(unavailable("does not exist"));
        }
        if self.property(dataset, "type")? != "filesystem" {
            return Err(unavailable("is not a filesystem"));
        }
        if self.property(dataset, MANAGED_PROPERTY)? != "on" {
            return Err(unavailable("is not managed by ocigraph"));
        }
        Ok(())
    }

    fn create(&self, id: &FilesystemId, parent: Option<&FilesystemId>) -> Result<String> {
        let dataset = self.dataset(id);
        let mountpoint = format!("mountpoint={}", self.mountpoint(id).display());
        match parent {
            Some(parent) => {
                let origin = self.snapshot(parent);
                if !self.target_exists(&origin)? {
                    return Err(Error::InvalidState(format!(
                        "filesystem {} has no frozen snapshot to clone",
                        parent
                    )));
                }
                self.zfs(
                    "clone",
                    &dataset,
                    &["clone", "-o", "canmount=noauto", "-o", &mountpoint, &origin, &dataset],
                )?;
            }
            None => {
                self.zfs(
                    "create",
                    &dataset,
                    &["create", "-o", "canmount=noauto", "-o", &mountpoint, &dataset],
                )?;
            }
        }
        debug!(fs = %id, %dataset, "created zfs dataset");
        Ok(dataset)
    }

    fn mount(&self, id: &FilesystemId) -> Result<PathBuf> {
        if !self.is_mounted(id)? {
            let dataset = self.dataset(id);
            self.zfs("mount", &dataset, &["mount", &dataset])?;
        }
        Ok(self.mountpoint(id))
    }

    fn unmount(&self, id: &FilesystemId) -> Result<()> {
        if self.is_mounted(id)? {
            let dataset = self.dataset(id);
            self.zfs("unmount", &dataset, &["unmount", &dataset])?;
        }
        Ok(())
    }

    fn freeze(&self, id: &FilesystemId) -> Result<SnapshotRef> {
        let snapshot = self.snapshot(id);
        if self.target_exists(&snapshot)? {
            let clones = self.clones(id)?;
            if !clones.is_empty() {
                return Err(Error::InUse(format!(
                    "snapshot {} has clones: {}",
                    snapshot,
                    clones.join(", ")
                )));
            }
            self.zfs("destroy", &snapshot, &["destroy", &snapshot])?;
        }
        self.zfs("snapshot", &snapshot, &["snapshot", &snapshot])?;
        Ok(SnapshotRef(snapshot))
    }

    fn seal(&self, id: &FilesystemId) -> Result<()> {
        let dataset = self.dataset(id);
        self.zfs("set", &dataset, &["set", "readonly=on", &dataset])?;
        Ok(())
    }

    fn root_path(&self, id: &FilesystemId) -> PathBuf {
        self.mountpoint(id)
    }

    fn snapshot_path(&self, id: &FilesystemId) -> Result<PathBuf> {
        if !self.target_exists(&self.snapshot(id))? {
            return Err(Error::InvalidState(format!("filesystem {} is not frozen", id)));
        }
        // snapshots are only browsable through a mounted dataset
        let mountpoint = self.mount(id)?;
        Ok(mountpoint
            .join(ZFS_CONTROL_DIR)
            .join("snapshot")
            .join(SNAPSHOT_NAME))
    }

    fn native_diff(
        &self,
        id: &FilesystemId,
        parent: &FilesystemId,
        source: DiffSource,
    ) -> Result<Changeset> {
        let from = self.snapshot(parent);
        let to = match source {
            DiffSource::Snapshot => self.snapshot(id),
            DiffSource::Live => self.dataset(id),
        };
        let output = self.zfs("diff", &to, &["diff", "-H", "-F", &from, &to])?;

        let mut candidates = BTreeSet::new();
        for line in parse_zfs_diff(&output)? {
            for path in std::iter::once(&line.path).chain(line.new_path.as_ref()) {
                let rel = self.relative_path(id, path).ok_or_else(|| {
                    Error::backend("diff", to.as_str(), format!("path outside dataset: {}", path))
                })?;
                candidates.insert(rel);
            }
        }

        let old_root = self.snapshot_path(parent)?;
        let new_root = match source {
            DiffSource::Snapshot => self.snapshot_path(id)?,
            DiffSource::Live => self.mount(id)?,
        };
        debug!(fs = %id, candidates = candidates.len(), "classifying zfs diff");
        diff_candidates(&old_root, &new_root, candidates)
    }

    fn remove(&self, id: &FilesystemId) -> Result<()> {
        let clones = self.clones(id)?;
        if !clones.is_empty() {
            return Err(Error::InUse(format!(
                "filesystem {} has clones: {}",
                id,
                clones.join(", ")
            )));
        }
        self.unmount(id)?;
        let dataset = self.dataset(id);
        self.zfs("destroy", &dataset, &["destroy", "-r", &dataset])?;
        let mountpoint = self.mountpoint(id);
        if mountpoint.is_dir() {
            fs::remove_dir(&mountpoint).with_path(&mountpoint)?;
        }
        debug!(fs = %id, %dataset, "destroyed zfs dataset");
        Ok(())
    }

    fn exists(&self, id: &FilesystemId) -> Result<bool> {
        self.target_exists(&self.dataset(id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::{copy_tree, remove_path, scan_tree};
    use crate::ops::diff::fallback_diff;
    use crate::types::{ChangeKind, EntryType};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeDataset {
        mountpoint: Option<PathBuf>,
        mounted: bool,
        props: HashMap<String, String>,
        snapshot: bool,
        origin: Option<String>,
    }

    /// in-process stand-in for zfs: datasets are directories at their
    /// mountpoint, snapshots are copies under `.zfs/snapshot/frozen`
    pub(crate) struct FakeZfs {
        pool: String,
        health: String,
        datasets: Mutex<HashMap<String, FakeDataset>>,
    }

    impl FakeZfs {
        pub(crate) fn new(pool: &str) -> Self {
            Self::with_health(pool, "ONLINE")
        }

        pub(crate) fn with_health(pool: &str, health: &str) -> Self {
            Self {
                pool: pool.to_string(),
                health: health.to_string(),
                datasets: Mutex::new(HashMap::new()),
            }
        }
    }

    fn ok(stdout: impl Into<String>) -> Result<ZfsOutput> {
        Ok(ZfsOutput {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        })
    }

    fn fail(stderr: impl Into<String>) -> Result<ZfsOutput> {
        Ok(ZfsOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        })
    }

    fn snapshot_dir(mountpoint: &Path) -> PathBuf {
        mountpoint.join(".zfs/snapshot/frozen")
    }

    fn type_char(entry: EntryType) -> char {
        match entry {
            EntryType::Regular => 'F',
            EntryType::Directory => '/',
            EntryType::Symlink => '@',
            EntryType::Fifo => '|',
            EntryType::Socket => '=',
            EntryType::BlockDevice => 'B',
            EntryType::CharDevice => 'C',
        }
    }

    fn escape(path: &str) -> String {
        path.bytes()
            .map(|b| {
                if b > b' ' && b != b'\\' && b < 0x7f {
                    (b as char).to_string()
                } else {
                    format!("\\{:04o}", b)
                }
            })
            .collect()
    }

    /// split `-o key=value` options from positional args
    fn split_args<'a>(args: &[&'a str]) -> (HashMap<String, String>, Vec<&'a str>) {
        let mut opts = HashMap::new();
        let mut positional = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-o" => {
                    if let Some((k, v)) = iter.next().and_then(|kv| kv.split_once('=')) {
                        opts.insert(k.to_string(), v.to_string());
                    }
                }
                flag if flag.starts_with('-') => {}
                other => positional.push(other),
            }
        }
        (opts, positional)
    }

    impl ZfsCommand for FakeZfs {
        fn zpool(&self, args: &[&str]) -> Result<ZfsOutput> {
            match args {
                ["list", "-H", "-o", "name,health", pool] if *pool == self.pool => {
                    ok(format!("{}\t{}\n", self.pool, self.health))
                }
                ["list", ..] => fail("cannot open pool: no such pool"),
                _ => fail("unsupported zpool command"),
            }
        }

        fn zfs(&self, args: &[&str]) -> Result<ZfsOutput> {
            let mut datasets = self.datasets.lock().unwrap();
            let (cmd, rest) = args.split_first().unwrap();
            let (opts, pos) = split_args(rest);
            let split_snap = |t: &str| t.split_once('@').map(|(d, s)| (d.to_string(), s.to_string()));

            match *cmd {
                "list" => {
                    let target = pos[0];
                    let found = match split_snap(target) {
                        Some((ds, _)) => datasets.get(&ds).is_some_and(|d| d.snapshot),
                        None => datasets.contains_key(target),
                    };
                    if found {
                        ok(format!("{}\n", target))
                    } else {
                        fail(format!("cannot open '{}': dataset does not exist", target))
                    }
                }
                "get" => {
                    let (prop, target) = (pos[0], pos[1]);
                    if let Some((ds, _)) = split_snap(target) {
                        let value = match prop {
                            "type" => "snapshot".to_string(),
                            "clones" => datasets
                                .iter()
                                .filter(|(_, d)| d.origin.as_deref() == Some(target))
                                .map(|(name, _)| name.clone())
                                .collect::<Vec<_>>()
                                .join(","),
                            _ => "-".to_string(),
                        };
                        return if datasets.get(&ds).is_some_and(|d| d.snapshot) {
                            ok(format!("{}\n", value))
                        } else {
                            fail("dataset does not exist")
                        };
                    }
                    let Some(ds) = datasets.get(target) else {
                        return fail(format!("cannot open '{}': dataset does not exist", target));
                    };
                    let value = match prop {
                        "type" => "filesystem".to_string(),
                        "mounted" => if ds.mounted { "yes" } else { "no" }.to_string(),
                        other => ds.props.get(other).cloned().unwrap_or_else(|| "-".to_string()),
                    };
                    ok(format!("{}\n", value))
                }
                "set" => {
                    let (kv, target) = (pos[0], pos[1]);
                    let (k, v) = kv.split_once('=').unwrap();
                    match datasets.get_mut(target) {
                        Some(ds) => {
                            ds.props.insert(k.to_string(), v.to_string());
                            ok("")
                        }
                        None => fail("dataset does not exist"),
                    }
                }
                "create" => {
                    let name = pos[0].to_string();
                    if datasets.contains_key(&name) {
                        return fail("dataset already exists");
                    }
                    let mountpoint = opts.get("mountpoint").map(PathBuf::from);
                    if let Some(mp) = &mountpoint {
                        fs::create_dir_all(mp).unwrap();
                    }
                    datasets.insert(
                        name,
                        FakeDataset {
                            mountpoint,
                            ..Default::default()
                        },
                    );
                    ok("")
                }
                "clone" => {
                    let (origin, name) = (pos[0], pos[1].to_string());
                    let (origin_ds, _) = split_snap(origin).unwrap();
                    let Some(source) = datasets
                        .get(&origin_ds)
                        .filter(|d| d.snapshot)
                        .and_then(|d| d.mountpoint.clone())
                    else {
                        return fail("snapshot does not exist");
                    };
                    let mp = PathBuf::from(&opts["mountpoint"]);
                    copy_tree(&snapshot_dir(&source), &mp).unwrap();
                    datasets.insert(
                        name,
                        FakeDataset {
                            mountpoint: Some(mp),
                            origin: Some(origin.to_string()),
                            ..Default::default()
                        },
                    );
                    ok("")
                }
                "mount" | "unmount" => match datasets.get_mut(pos[0]) {
                    Some(ds) => {
                        ds.mounted = *cmd == "mount";
                        ok("")
                    }
                    None => fail("dataset does not exist"),
                },
                "snapshot" => {
                    let (ds_name, _) = split_snap(pos[0]).unwrap();
                    let Some(ds) = datasets.get_mut(&ds_name) else {
                        return fail("dataset does not exist");
                    };
                    if ds.snapshot {
                        return fail("snapshot already exists");
                    }
                    let mp = ds.mountpoint.clone().unwrap();
                    let snap = snapshot_dir(&mp);
                    fs::create_dir_all(snap.parent().unwrap()).unwrap();
                    copy_tree(&mp, &snap).unwrap();
                    ds.snapshot = true;
                    ok("")
                }
                "destroy" => {
                    let target = pos[0];
                    let cloned = |prefix: &str| {
                        datasets
                            .values()
                            .any(|d| d.origin.as_deref().is_some_and(|o| o.starts_with(prefix)))
                    };
                    if let Some((ds_name, _)) = split_snap(target) {
                        if cloned(target) {
                            return fail("snapshot has dependent clones");
                        }
                        let ds = datasets.get_mut(&ds_name).unwrap();
                        remove_path(&snapshot_dir(ds.mountpoint.as_ref().unwrap())).unwrap();
                        ds.snapshot = false;
                        return ok("");
                    }
                    if cloned(&format!("{}@", target)) {
                        return fail("filesystem has dependent clones");
                    }
                    match datasets.remove(target) {
                        Some(ds) => {
                            if let Some(mp) = ds.mountpoint {
                                remove_path(&mp.join(".zfs")).unwrap();
                                for entry in fs::read_dir(&mp).unwrap() {
                                    remove_path(&entry.unwrap().path()).unwrap();
                                }
                            }
                            ok("")
                        }
                        None => fail("dataset does not exist"),
                    }
                }
                "diff" => {
                    let (from, to) = (pos[0], pos[1]);
                    let (from_ds, _) = split_snap(from).unwrap();
                    let old_root = snapshot_dir(datasets[&from_ds].mountpoint.as_ref().unwrap());
                    let (to_ds, to_snap) = match split_snap(to) {
                        Some((ds, _)) => (ds, true),
                        None => (to.to_string(), false),
                    };
                    let to_mp = datasets[&to_ds].mountpoint.clone().unwrap();
                    let new_root = if to_snap { snapshot_dir(&to_mp) } else { to_mp.clone() };

                    let old = scan_tree(&old_root).unwrap();
                    let new = scan_tree(&new_root).unwrap();
                    let display = |p: &str| escape(&format!("{}{}", to_mp.display(), p));
                    // every common path is reported as modified: a superset
                    // of what zfs reports, which the classifier narrows down
                    let mut out = String::new();
                    for (path, meta) in &new {
                        let change = if old.contains_key(path) { 'M' } else { '+' };
                        out.push_str(&format!("{}\t{}\t{}\n", change, type_char(meta.entry), display(path)));
                    }
                    for (path, meta) in old.iter().filter(|(p, _)| !new.contains_key(*p)) {
                        out.push_str(&format!("-\t{}\t{}\n", type_char(meta.entry), display(path)));
                    }
                    ok(out)
                }
                other => fail(format!("unsupported zfs command {}", other)),
            }
        }
    }

    pub(crate) fn test_backend(native_diff: bool) -> (tempfile::TempDir, ZfsBackend) {
        let dir = tempdir().unwrap();
        let config = ZfsConfig {
            dataset: "tank/graph".to_string(),
            native_diff,
            ..ZfsConfig::default()
        };
        let backend = ZfsBackend::new(config, dir.path().join("mnt"), Box::new(FakeZfs::new("tank")));
        backend.prepare().unwrap();
        (dir, backend)
    }

    #[test]
    fn test_parse_zfs_diff_lines() {
        let out = "M\t/\t/mnt/A/dir\n+\tF\t/mnt/A/dir/new\\0040file\nR\tF\t/mnt/A/old\t/mnt/A/renamed\n";
        let lines = parse_zfs_diff(out).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].change, 'M');
        assert_eq!(lines[0].file_type, '/');
        assert_eq!(lines[1].path, "/mnt/A/dir/new file");
        assert_eq!(lines[2].new_path.as_deref(), Some("/mnt/A/renamed"));
    }

    #[test]
    fn test_parse_zfs_diff_rejects_garbage() {
        assert!(parse_zfs_diff("what\tis\tthis\n").is_err());
        assert!(parse_zfs_diff("R\tF\t/only/one/path\n").is_err());
    }

    #[test]
    fn test_decode_escapes_utf8() {
        assert_eq!(decode_escapes("caf\\0303\\0251"), "café");
        assert_eq!(decode_escapes("trailing\\12"), "trailing\\12");
    }

    #[test]
    fn test_validate_rejects_missing_pool() {
        let dir = tempdir().unwrap();
        let backend = ZfsBackend::new(
            ZfsConfig {
                dataset: "other/graph".to_string(),
                ..ZfsConfig::default()
            },
            dir.path().join("mnt"),
            Box::new(FakeZfs::new("tank")),
        );
        assert!(matches!(backend.validate(), Err(Error::BackendUnavailable(_))));
        assert!(matches!(backend.prepare(), Err(Error::BackendUnavailable(_))));
    }

    #[test]
    fn test_validate_rejects_degraded_pool() {
        let dir = tempdir().unwrap();
        let backend = ZfsBackend::new(
            ZfsConfig {
                dataset: "tank/graph".to_string(),
                ..ZfsConfig::default()
            },
            dir.path().join("mnt"),
            Box::new(FakeZfs::with_health("tank", "DEGRADED")),
        );
        assert!(matches!(backend.validate(), Err(Error::BackendUnavailable(_))));
    }

    #[test]
    fn test_validate_rejects_unmanaged_dataset() {
        let dir = tempdir().unwrap();
        let fake = FakeZfs::new("tank");
        // look-alike dataset created by someone else
        fake.zfs(&["create", "tank/graph"]).unwrap();
        let backend = ZfsBackend::new(
            ZfsConfig {
                dataset: "tank/graph".to_string(),
                ..ZfsConfig::default()
            },
            dir.path().join("mnt"),
            Box::new(fake),
        );
        assert!(matches!(backend.validate(), Err(Error::BackendUnavailable(_))));
        backend.prepare().unwrap();
        backend.validate().unwrap();
    }

    #[test]
    fn test_mount_is_idempotent() {
        let (_dir, backend) = test_backend(true);
        let id = FilesystemId::generate();
        assert_eq!(backend.create(&id, None).unwrap(), format!("tank/graph/{}", id));

        let p1 = backend.mount(&id).unwrap();
        let p2 = backend.mount(&id).unwrap();
        assert_eq!(p1, p2);
        backend.unmount(&id).unwrap();
        backend.unmount(&id).unwrap();
    }

    #[test]
    fn test_remove_refused_while_cloned() {
        let (_dir, backend) = test_backend(true);
        let parent = FilesystemId::generate();
        backend.create(&parent, None).unwrap();
        backend.freeze(&parent).unwrap();
        let child = FilesystemId::generate();
        backend.create(&child, Some(&parent)).unwrap();

        assert!(matches!(backend.remove(&parent), Err(Error::InUse(_))));
        backend.remove(&child).unwrap();
        backend.remove(&parent).unwrap();
        assert!(!backend.exists(&parent).unwrap());
    }

    #[test]
    fn test_native_and_fallback_diff_agree() {
        let (_dir, native) = test_backend(true);
        let parent = FilesystemId::generate();
        native.create(&parent, None).unwrap();
        let root = native.mount(&parent).unwrap();
        fs::write(root.join("a"), "0123456789").unwrap();
        fs::create_dir_all(root.join("old/nested")).unwrap();
        fs::write(root.join("old/nested/f"), "x").unwrap();
        fs::write(root.join("same"), "unchanged").unwrap();
        native.freeze(&parent).unwrap();

        let child = FilesystemId::generate();
        native.create(&child, Some(&parent)).unwrap();
        let root = native.mount(&child).unwrap();
        fs::write(root.join("a"), "01234567890123456789").unwrap();
        fs::write(root.join("b c"), "hello").unwrap();
        remove_path(&root.join("old")).unwrap();
        native.freeze(&child).unwrap();

        let via_zfs = native.diff(&child, Some(&parent), DiffSource::Snapshot).unwrap();
        let walked = fallback_diff(
            Some(&native.snapshot_path(&parent).unwrap()),
            &native.snapshot_path(&child).unwrap(),
        )
        .unwrap();

        assert_eq!(via_zfs, walked);
        let summary: Vec<_> = via_zfs.changes().iter().map(|c| c.to_string()).collect();
        assert_eq!(
            summary,
            vec!["M /a", "A /b c", "D /old", "D /old/nested", "D /old/nested/f"]
        );
        assert_eq!(via_zfs.get("/a").unwrap().kind, ChangeKind::Modified);
    }

    #[test]
    fn test_base_filesystem_diff_walks() {
        let (_dir, backend) = test_backend(true);
        let id = FilesystemId::generate();
        backend.create(&id, None).unwrap();
        let root = backend.mount(&id).unwrap();
        fs::write(root.join("a"), "0123456789").unwrap();
        backend.freeze(&id).unwrap();

        let cs = backend.diff(&id, None, DiffSource::Snapshot).unwrap();
        assert_eq!(cs.len(), 1);
        assert_eq!(cs.size_bytes(), 10);
    }
}
