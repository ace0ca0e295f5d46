// build.rs for fileproc
//
// Generates the prost messages and tonic client/server stubs for
// `proto/file_processor.proto`. protoc comes from `protoc-bin-vendored` unless
// the caller already points `PROTOC` at an installed compiler.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/file_processor.proto");
    println!("cargo:rerun-if-env-changed=PROTOC");

    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/file_processor.proto"], &["proto"])?;

    Ok(())
}
