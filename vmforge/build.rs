//! Links against the libkrun-family hypervisor shared library.
//!
//! The library itself is an external collaborator (see SPEC_FULL.md,
//! "Open Questions resolved" (a)): this build script only tells the linker
//! where to find it. `VMFORGE_LIBKRUN_LIB_DIR` lets packaging pin a
//! specific build without touching source.

fn main() {
    if let Ok(dir) = std::env::var("VMFORGE_LIBKRUN_LIB_DIR") {
        println!("cargo:rustc-link-search=native={dir}");
    }
    println!("cargo:rustc-link-lib=dylib=krun");
    println!("cargo:rerun-if-env-changed=VMFORGE_LIBKRUN_LIB_DIR");
}
