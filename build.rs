// Embeds build metadata (VERGEN_BUILD_TIMESTAMP, VERGEN_CARGO_TARGET_TRIPLE)
// for the startup log line. Missing metadata never fails the build.
fn main() {
    use vergen::{BuildBuilder, CargoBuilder, Emitter};

    println!("cargo:rerun-if-changed=build.rs");

    let mut emitter = Emitter::default();
    match BuildBuilder::default().build_timestamp(true).build() {
        Ok(build) => {
            let _ = emitter.add_instructions(&build);
        }
        Err(e) => println!("cargo:warning=build timestamp unavailable: {e}"),
    }
    match CargoBuilder::default().target_triple(true).build() {
        Ok(cargo) => {
            let _ = emitter.add_instructions(&cargo);
        }
        Err(e) => println!("cargo:warning=cargo metadata unavailable: {e}"),
    }

    if let Err(e) = emitter.emit() {
        println!("cargo:warning=vergen emit skipped: {e}");
    }
}
