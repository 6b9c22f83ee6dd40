use std::time::Duration;

use flagsense::{ClientConfig, FlagRef, User};

pub fn main() -> flagsense::Result<()> {
    env_logger::init();

    let sdk_id = std::env::var("FLAGSENSE_SDK_ID").unwrap_or_default();
    let sdk_secret = std::env::var("FLAGSENSE_SDK_SECRET").unwrap_or_default();
    let client = ClientConfig::new(sdk_id, sdk_secret)
        .environment(std::env::var("FLAGSENSE_ENVIRONMENT").unwrap_or_default())
        .max_initialization_wait(Duration::from_secs(10))
        .to_client()?;

    // Block waiting for configuration. Until the first fetch completes, the client serves default
    // variations.
    if let Err(err) = client.wait_for_initialization() {
        eprintln!("Serving defaults: {err}");
    }

    let user = User::new("test-user")
        .with_attribute("country", "IN")
        .with_attribute("app_version", "2.4.1");

    let flag = FlagRef::new("a-boolean-flag", "off", false);
    let variation = client.get_variation(&flag, &user);
    println!("Variation: {} = {}", variation.key, variation.value);

    client.record_event(&user, "a-boolean-flag", "demo-run");

    // Flush aggregated events before exit.
    client.shutdown()
}
