fn main() {
    println!("cargo:rerun-if-changed=csrc/jump.c");

    cc::Build::new()
        .file("csrc/jump.c")
        .flag_if_supported("-fno-omit-frame-pointer")
        .compile("sigsampler_jump");
}
