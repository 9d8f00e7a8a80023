fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
    let out_dir = std::env::var("OUT_DIR")?;
    let proto_path = format!("{}/proto/csi.proto", manifest_dir);
    let proto_dir = format!("{}/proto", manifest_dir);
    let descriptor_path = format!("{}/csi_descriptor.bin", out_dir);

    // Hosts without a system protoc still build; an explicit PROTOC wins.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded at this point.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }
    let well_known = protoc_bin_vendored::include_path()?;

    println!("cargo:rerun-if-changed={proto_path}");

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(
            &[proto_path],
            &[proto_dir, well_known.to_string_lossy().into_owned()],
        )?;
    Ok(())
}
