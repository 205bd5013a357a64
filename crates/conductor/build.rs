fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/vf_conductor.proto");

    if std::env::var_os("CARGO_FEATURE_GRPC").is_none() {
        return Ok(());
    }

    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    tonic_build::configure().compile_protos(&["proto/vf_conductor.proto"], &["proto"])?;
    Ok(())
}
