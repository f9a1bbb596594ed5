//! Managed datastore tree for OpenHVX hosts
//!
//! Everything the agent (and the action scripts through it) writes on disk
//! lives under `<basePath>/openhvx/`. This module is the only sanctioned way
//! to touch that tree:
//! - Path predicates keep every operation strictly inside the managed root
//! - Writes are atomic and collision-free (unique names, exclusive create)
//! - Nothing is ever deleted; destructive operations move targets to `_trash`

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::warn;

/// Notice dropped into every managed directory on first ensure.
const GUARD_FILE: &str = "DO-NOT-DELETE.txt";
const GUARD_TEXT: &str = "Managed by OpenHVX. Do NOT delete this folder. \
Any destructive operation must move targets into '_trash'.\n";

/// The protected directory set under `<basePath>/openhvx/`.
///
/// Every member may be created but never renamed, deleted, or used as the
/// direct target of a destructive operation. `images` is read-only by policy.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub root: PathBuf,
    pub vms: PathBuf,
    pub vhd: PathBuf,
    pub images: PathBuf,
    pub isos: PathBuf,
    pub checkpoints: PathBuf,
    pub logs: PathBuf,
    pub trash: PathBuf,
}

impl DataDirs {
    /// Create the managed tree under `base_path`. Creates only, never
    /// removes. Idempotent: a second call changes nothing on disk.
    pub fn ensure(base_path: &str) -> Result<Self> {
        if base_path.is_empty() {
            bail!("basePath is empty");
        }
        let root = canonicalize(Path::new(base_path))?.join("openhvx");
        let dirs = Self {
            vms: root.join("VMS"),
            vhd: root.join("VHD"),
            images: root.join("Images"),
            isos: root.join("ISOs"),
            checkpoints: root.join("Checkpoints"),
            logs: root.join("Logs"),
            trash: root.join("_trash"),
            root,
        };
        for dir in dirs.protected() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("mkdir {}", dir.display()))?;
        }
        if let Err(e) = dirs.write_guards() {
            warn!("guard file write failed: {e:#}");
        }
        Ok(dirs)
    }

    /// The protected set, root first.
    pub fn protected(&self) -> [&Path; 8] {
        [
            &self.root,
            &self.vms,
            &self.vhd,
            &self.images,
            &self.isos,
            &self.checkpoints,
            &self.logs,
            &self.trash,
        ]
    }

    fn write_guards(&self) -> Result<()> {
        let mut first_err = None;
        for dir in self.protected() {
            let guard = dir.join(GUARD_FILE);
            if guard.exists() {
                continue;
            }
            if let Err(e) = std::fs::write(&guard, GUARD_TEXT) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// One-line path summary for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "root={} vms={} vhd={} images={} isos={} checkpoints={} logs={} trash={}",
            self.root.display(),
            self.vms.display(),
            self.vhd.display(),
            self.images.display(),
            self.isos.display(),
            self.checkpoints.display(),
            self.logs.display(),
            self.trash.display(),
        )
    }

    /// True iff `p` is one of the protected directories themselves.
    pub fn is_protected(&self, p: &Path) -> bool {
        let p = clean(p);
        self.protected().iter().any(|d| clean(d) == p)
    }

    /// Fail unless `target` lies strictly under the managed root and is not
    /// itself a protected directory. The target does not have to exist.
    pub fn assert_safe_target(&self, target: &Path) -> Result<PathBuf> {
        let canon = canonicalize(target)?;
        if !is_under(&canon, &self.root) {
            bail!(
                "unsafe target: {} is not under {}",
                canon.display(),
                self.root.display()
            );
        }
        if self.is_protected(&canon) {
            bail!("refuse to operate on protected dir: {}", canon.display());
        }
        Ok(canon)
    }

    /// Create a directory (with intermediates) under the managed root.
    pub fn safe_mkdir_all(&self, dir: &Path) -> Result<PathBuf> {
        let canon = self.assert_safe_target(dir)?;
        std::fs::create_dir_all(&canon)
            .with_context(|| format!("mkdir {}", canon.display()))?;
        Ok(canon)
    }

    /// Open a new file for writing, exclusively. If `dest` exists a unique
    /// sibling name is chosen instead. Returns the open file and the path
    /// actually used.
    pub fn safe_create_file(&self, dest: &Path) -> Result<(File, PathBuf)> {
        let canon = self.assert_safe_target(dest)?;
        prepare_parent(&canon)?;
        let final_path = unique_path(&canon)?;
        // create_new closes the probe-vs-create race: a concurrent writer
        // landing on the same name makes the open fail instead of clobbering.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&final_path)
            .with_context(|| format!("exclusive create {}", final_path.display()))?;
        Ok((file, final_path))
    }

    /// Write `data` atomically without ever overwriting an existing file:
    /// same-directory temp file, sync, then a no-clobber rename onto a unique
    /// destination. The temp file is removed on any failure. Returns the path
    /// actually written.
    pub fn safe_write_file_atomic_unique(&self, dest: &Path, data: &[u8]) -> Result<PathBuf> {
        let canon = self.assert_safe_target(dest)?;
        prepare_parent(&canon)?;
        let parent = canon.parent().context("destination has no parent")?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".openhvx-")
            .tempfile_in(parent)
            .with_context(|| format!("create temp in {}", parent.display()))?;
        io::Write::write_all(&mut tmp, data).context("write temp")?;
        tmp.as_file().sync_all().context("sync temp")?;

        let final_path = unique_path(&canon)?;
        match tmp.persist_noclobber(&final_path) {
            Ok(_) => Ok(final_path),
            // PersistError hands the temp file back; dropping it unlinks it.
            Err(e) => Err(e.error).with_context(|| {
                format!("atomic rename to {}", final_path.display())
            }),
        }
    }

    /// Rename `src` to `dst` without overwriting; if `dst` exists, a unique
    /// sibling name is chosen. Returns the destination actually used.
    pub fn safe_rename_no_overwrite(&self, src: &Path, dst: &Path) -> Result<PathBuf> {
        let src_canon = self.assert_safe_target(src).context("invalid src")?;
        let dst_canon = self.assert_safe_target(dst).context("invalid dst")?;
        prepare_parent(&dst_canon)?;
        let final_dst = unique_path(&dst_canon)?;
        std::fs::rename(&src_canon, &final_dst).with_context(|| {
            format!("rename {} -> {}", src_canon.display(), final_dst.display())
        })?;
        Ok(final_dst)
    }

    /// Copy `src` to `dst` without overwriting. Only for when rename is
    /// impossible (cross-device); the destination is opened exclusively.
    pub fn safe_copy_file_no_overwrite(&self, src: &Path, dst: &Path) -> Result<PathBuf> {
        let src_canon = self.assert_safe_target(src).context("invalid src")?;
        let dst_canon = self.assert_safe_target(dst).context("invalid dst")?;
        let mut input = File::open(&src_canon)
            .with_context(|| format!("open {}", src_canon.display()))?;
        prepare_parent(&dst_canon)?;
        let final_dst = unique_path(&dst_canon)?;
        let mut output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&final_dst)
            .with_context(|| format!("exclusive create {}", final_dst.display()))?;
        io::copy(&mut input, &mut output)
            .with_context(|| format!("copy to {}", final_dst.display()))?;
        output.sync_all().context("sync copy")?;
        Ok(final_dst)
    }

    /// Relocate a file or directory into `_trash/<UTC stamp>/<path relative
    /// to root>`. Nothing is ever unlinked; collisions get a unique name.
    pub fn move_to_trash(&self, target: &Path) -> Result<PathBuf> {
        let src = self.assert_safe_target(target)?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let rel = src
            .strip_prefix(&self.root)
            .context("target not relative to root")?;
        let dst = self.trash.join(stamp).join(rel);
        prepare_parent(&dst).context("prepare trash dir")?;
        let unique_dst = unique_path(&dst)?;
        std::fs::rename(&src, &unique_dst).with_context(|| {
            format!("move to trash: {} -> {}", src.display(), unique_dst.display())
        })?;
        Ok(unique_dst)
    }

    /// Compose a VM directory under `VMS` (e.g. `VMS/<vm>`), verifying the
    /// result stays inside the managed root.
    pub fn join_vm_dir<I, S>(&self, parts: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        let mut path = self.vms.clone();
        for part in parts {
            path.push(part);
        }
        let canon = canonicalize(&path)?;
        if !is_under(&canon, &self.root) {
            bail!("vm dir escapes root: {}", canon.display());
        }
        Ok(canon)
    }

    /// Tenant-scoped VM directory: `VMS/<tenant>/<vm>`.
    pub fn join_tenant_vm_dir(&self, tenant_id: &str, vm: &str) -> Result<PathBuf> {
        self.join_vm_dir([tenant_id, vm])
    }

    /// Compose a path under the read-only `Images` datastore.
    pub fn join_images_path<I, S>(&self, parts: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        let mut path = self.images.clone();
        for part in parts {
            path.push(part);
        }
        let canon = canonicalize(&path)?;
        if !is_under(&canon, &self.images) {
            bail!("image path escapes Images: {}", canon.display());
        }
        Ok(canon)
    }

    /// Verify that `p` names an existing, readable file under `Images`.
    pub fn assert_readable_image(&self, p: &Path) -> Result<PathBuf> {
        let canon = canonicalize(p)?;
        if !is_under(&canon, &self.images) {
            bail!("not an Images path: {}", canon.display());
        }
        let meta = std::fs::metadata(&canon)
            .with_context(|| format!("stat {}", canon.display()))?;
        if !meta.is_file() {
            bail!("not a file: {}", canon.display());
        }
        File::open(&canon)
            .with_context(|| format!("open {}", canon.display()))?;
        Ok(canon)
    }
}

/// Absolute, lexically cleaned form of `p`. Fails on empty input. Does not
/// require the path to exist and does not resolve symlinks.
pub fn canonicalize(p: &Path) -> Result<PathBuf> {
    if p.as_os_str().is_empty() {
        bail!("empty path");
    }
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().context("current dir")?.join(p)
    };
    Ok(clean(&abs))
}

/// Lexical path cleanup: drops `.` components and resolves `..` against the
/// preceding component where possible.
fn clean(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                );
                if popped {
                    out.pop();
                } else if !matches!(
                    out.components().next_back(),
                    Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// True iff `p` lies strictly below `base` (not equal, no escape).
pub fn is_under(p: &Path, base: &Path) -> bool {
    let p = clean(p);
    let base = clean(base);
    if p == base {
        return false;
    }
    match p.strip_prefix(&base) {
        Ok(rel) => !rel.as_os_str().is_empty(),
        Err(_) => false,
    }
}

fn prepare_parent(p: &Path) -> Result<()> {
    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("prepare parent {}", parent.display()))?;
    }
    Ok(())
}

/// A path based on `p` that does not currently exist: `p` itself if free,
/// else `name (1).ext` through `name (9999).ext`, else a UTC timestamp
/// suffix. Deterministic given the observed filesystem state.
pub fn unique_path(p: &Path) -> Result<PathBuf> {
    // Lstat, not stat: a dangling symlink still occupies the name.
    let free = |candidate: &Path| match candidate.symlink_metadata() {
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        _ => false,
    };

    if free(p) {
        return Ok(p.to_path_buf());
    }

    let dir = p.parent().map(Path::to_path_buf).unwrap_or_default();
    let (name, ext) = split_name(p);

    for i in 1..=9999 {
        let candidate = dir.join(format!("{name} ({i}){ext}"));
        if free(&candidate) {
            return Ok(candidate);
        }
    }

    let ts = Utc::now().format("%Y%m%d-%H%M%S%.3f");
    let candidate = dir.join(format!("{name}-{ts}{ext}"));
    if free(&candidate) {
        return Ok(candidate);
    }
    bail!("unable to find a free name for {}", p.display())
}

/// Split a file name into stem and `.ext` suffix (empty when none).
fn split_name(p: &Path) -> (String, String) {
    let base = p
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (base, String::new()),
    }
}
