use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Seconds since the Unix epoch at build time. The RTC falls back to this
    // when its stored time is implausible and compiler-time recovery is enabled.
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=CROC_BUILD_EPOCH={epoch}");
    println!("cargo:rerun-if-changed=build.rs");
}
