fn main() {
    // every binary is a multiboot image linked at the kernel window
    println!("cargo:rustc-link-arg=-Tlinker.ld");
    println!("cargo:rerun-if-changed=linker.ld");
}
