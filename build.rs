// Build script: link the native libraries static FFmpeg needs on Windows
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Only the ffmpeg feature pulls in the static FFmpeg build
    if std::env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();
    if target_os == "windows" && target_env == "msvc" {
        // Intel QSV (Quick Sync Video)
        println!("cargo:rustc-link-lib=dylib=libmfx");

        // x264
        println!("cargo:rustc-link-lib=dylib=libx264");

        // OLE automation and VFW
        println!("cargo:rustc-link-lib=dylib=oleaut32");
        println!("cargo:rustc-link-lib=dylib=vfw32");

        // Secure Channel (TLS for rtsps)
        println!("cargo:rustc-link-lib=dylib=secur32");
    }
}
