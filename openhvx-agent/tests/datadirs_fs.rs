//! Managed-tree filesystem behavior, end to end on a scratch directory.

use std::path::Path;

use openhvx_agent::datadirs::{unique_path, DataDirs};
use openhvx_devkit::scratch_base;

fn read(p: &Path) -> Vec<u8> {
    std::fs::read(p).unwrap()
}

#[test]
fn ensure_creates_tree_and_guard_files() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    for dir in dirs.protected() {
        assert!(dir.is_dir(), "{} missing", dir.display());
        assert!(
            dir.join("DO-NOT-DELETE.txt").is_file(),
            "guard missing in {}",
            dir.display()
        );
    }
    assert!(dirs.root.ends_with("openhvx"));
}

#[test]
fn ensure_is_idempotent_and_never_rewrites_guards() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    // Mark a guard file; a second ensure must leave it untouched.
    let guard = dirs.vms.join("DO-NOT-DELETE.txt");
    std::fs::write(&guard, b"locally annotated").unwrap();

    let again = DataDirs::ensure(&base).unwrap();
    assert_eq!(again.root, dirs.root);
    assert_eq!(read(&guard), b"locally annotated");
}

#[test]
fn atomic_write_allocates_unique_names_without_loss() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();
    let target = dirs.vms.join("a.txt");

    let first = dirs.safe_write_file_atomic_unique(&target, b"one").unwrap();
    let second = dirs.safe_write_file_atomic_unique(&target, b"two").unwrap();

    assert_eq!(first, target);
    assert_eq!(second, dirs.vms.join("a (1).txt"));
    assert_eq!(read(&first), b"one");
    assert_eq!(read(&second), b"two");

    // Nothing else appeared in the directory: two payload files plus the
    // guard file, no leftover temp.
    let mut names: Vec<String> = std::fs::read_dir(&dirs.vms)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["DO-NOT-DELETE.txt", "a (1).txt", "a.txt"]);
}

#[test]
fn write_creates_missing_subdirectories() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();
    let target = dirs.vms.join("tenant-1").join("vm-7").join("notes.json");

    let written = dirs.safe_write_file_atomic_unique(&target, b"{}").unwrap();
    assert_eq!(written, target);
    assert_eq!(read(&written), b"{}");
}

#[test]
fn protected_targets_are_refused_untouched() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    for protected in dirs.protected().map(Path::to_path_buf) {
        assert!(dirs.assert_safe_target(&protected).is_err());
        assert!(dirs.safe_write_file_atomic_unique(&protected, b"x").is_err());
        assert!(dirs.move_to_trash(&protected).is_err());
        assert!(protected.is_dir(), "{} was disturbed", protected.display());
    }

    let outside = Path::new(&base).join("elsewhere.txt");
    assert!(dirs.assert_safe_target(&outside).is_err());
    assert!(!outside.exists());

    let escape = dirs.vms.join("..").join("..").join("escape.txt");
    assert!(dirs.safe_write_file_atomic_unique(&escape, b"x").is_err());
}

#[test]
fn safe_create_file_is_exclusive() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();
    let target = dirs.vhd.join("disk.vhdx");

    let (file, path) = dirs.safe_create_file(&target).unwrap();
    drop(file);
    assert_eq!(path, target);

    let (_file2, path2) = dirs.safe_create_file(&target).unwrap();
    assert_eq!(path2, dirs.vhd.join("disk (1).vhdx"));
}

#[test]
fn rename_never_overwrites() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    let src = dirs.vms.join("old.txt");
    let dst = dirs.vms.join("new.txt");
    dirs.safe_write_file_atomic_unique(&src, b"payload").unwrap();
    dirs.safe_write_file_atomic_unique(&dst, b"occupied").unwrap();

    let moved = dirs.safe_rename_no_overwrite(&src, &dst).unwrap();
    assert_eq!(moved, dirs.vms.join("new (1).txt"));
    assert_eq!(read(&moved), b"payload");
    assert_eq!(read(&dst), b"occupied");
    assert!(!src.exists());
}

#[test]
fn copy_never_overwrites_and_preserves_source() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    let src = dirs.isos.join("image.iso");
    let dst = dirs.vms.join("image.iso");
    dirs.safe_write_file_atomic_unique(&src, b"iso bytes").unwrap();
    dirs.safe_write_file_atomic_unique(&dst, b"other").unwrap();

    let copied = dirs.safe_copy_file_no_overwrite(&src, &dst).unwrap();
    assert_eq!(copied, dirs.vms.join("image (1).iso"));
    assert_eq!(read(&copied), b"iso bytes");
    assert_eq!(read(&src), b"iso bytes");
    assert_eq!(read(&dst), b"other");
}

#[test]
fn move_to_trash_relocates_under_timestamped_path() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    let victim = dirs.vms.join("tenant-1").join("vm.cfg");
    dirs.safe_write_file_atomic_unique(&victim, b"cfg").unwrap();

    let resting = dirs.move_to_trash(&victim).unwrap();
    assert!(!victim.exists());
    assert!(resting.starts_with(&dirs.trash));
    assert!(resting.ends_with(Path::new("VMS").join("tenant-1").join("vm.cfg")));
    assert_eq!(read(&resting), b"cfg");
}

#[test]
fn move_to_trash_handles_directories() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    let vm_dir = dirs.join_tenant_vm_dir("tenant-1", "vm-9").unwrap();
    dirs.safe_mkdir_all(&vm_dir).unwrap();
    dirs.safe_write_file_atomic_unique(&vm_dir.join("state.bin"), b"\x00\x01")
        .unwrap();

    let resting = dirs.move_to_trash(&vm_dir).unwrap();
    assert!(!vm_dir.exists());
    assert_eq!(read(&resting.join("state.bin")), b"\x00\x01");
}

#[test]
fn unique_path_timestamp_fallback_shape() {
    let (_keep, base) = scratch_base();
    let root = Path::new(&base);

    // Only the direct target occupied: the probe picks " (1)".
    std::fs::write(root.join("x.txt"), b"").unwrap();
    let next = unique_path(&root.join("x.txt")).unwrap();
    assert_eq!(next, root.join("x (1).txt"));
}

#[test]
fn vm_and_image_helpers_stay_in_their_subroots() {
    let (_keep, base) = scratch_base();
    let dirs = DataDirs::ensure(&base).unwrap();

    let vm = dirs.join_vm_dir(["tenant-1", "web-01"]).unwrap();
    assert!(vm.starts_with(&dirs.vms));

    assert!(dirs.join_vm_dir(["..", "..", "escape"]).is_err());

    let img = dirs.join_images_path(["debian-12.vhdx"]).unwrap();
    assert!(img.starts_with(&dirs.images));
    assert!(dirs.join_images_path(["..", "VMS", "x"]).is_err());

    // Readable-image check requires an existing file.
    assert!(dirs.assert_readable_image(&img).is_err());
    std::fs::write(&img, b"golden").unwrap();
    assert_eq!(dirs.assert_readable_image(&img).unwrap(), img);
    assert!(dirs.assert_readable_image(&dirs.images).is_err());
}
