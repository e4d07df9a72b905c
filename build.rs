fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/kronos.proto");
    tonic_build::compile_protos("proto/kronos.proto")?;
    Ok(())
}
