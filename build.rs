use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc unless the caller already pinned one.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let proto_root = PathBuf::from("proto");
    let includes = vec![proto_root.clone(), protoc_bin_vendored::include_path()?];

    println!("cargo:rerun-if-changed=proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_root.join("dbplugin/v5/database.proto")], &includes[..])?;

    Ok(())
}
