fn main() {
    // Deployment overrides from `.env` next to this crate. Values already in
    // the environment win over the file.
    println!("cargo:rerun-if-changed=.env");
    let _ = dotenvy::dotenv();

    let autostart = std::env::var("CROC_AUTOSTART").unwrap_or_else(|_| "1".into());
    println!("cargo:rustc-env=CROC_AUTOSTART={autostart}");

    // Applied at boot on top of CONFIG.BIN when set.
    for key in ["CROC_TIMEZONE_HOURS", "CROC_SESSION_MINUTES"] {
        if let Ok(value) = std::env::var(key) {
            println!("cargo:rustc-env={key}={value}");
        }
        println!("cargo:rerun-if-env-changed={key}");
    }
    println!("cargo:rerun-if-env-changed=CROC_AUTOSTART");

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
