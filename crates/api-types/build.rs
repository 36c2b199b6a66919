fn main() -> Result<(), Box<dyn std::error::Error>> {
    // the plugin serves DevicePlugin and dials Registration; tests need the reverse
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/deviceplugin/v1beta1/api.proto"],
            &["proto/deviceplugin/v1beta1"],
        )?;
    Ok(())
}
