//! Build script for qscope.
//!
//! Embeds the eBPF object built by `cargo xtask build-ebpf`. When it has not
//! been built yet an empty placeholder is embedded instead, so the userspace
//! crate (and its tests) still compile; loading then fails with a hint.

use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let dest = out_dir.join("qscope.bpf.o");

    let manifest_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo"));
    let workspace_root = manifest_dir.parent().expect("crate lives inside the workspace");

    // Always the release build, see xtask
    let built = workspace_root.join("target/bpfel-unknown-none/release/qscope");
    println!("cargo:rerun-if-changed={}", built.display());

    if built.is_file() {
        fs::copy(&built, &dest).unwrap_or_else(|e| {
            panic!("Failed to copy eBPF binary from {} to {}: {e}", built.display(), dest.display())
        });
    } else {
        println!("cargo:warning=eBPF object not found, run `cargo xtask build-ebpf` first");
        fs::write(&dest, []).expect("write eBPF placeholder");
    }
}
