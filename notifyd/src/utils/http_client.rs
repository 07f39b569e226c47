use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::Result;

/// Install the process-wide rustls crypto provider once.
///
/// reqwest is built without a bundled provider, so this must run before the
/// first client is constructed.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build an HTTP client for outbound deliveries.
///
/// With `use_system_proxy = false` every proxy, including env/system ones,
/// is disabled.
pub fn build_client(timeout: Duration, use_system_proxy: bool) -> Result<reqwest::Client> {
    install_rustls_provider();
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("notifyd/", env!("CARGO_PKG_VERSION")));
    if !use_system_proxy {
        builder = builder.no_proxy();
    }
    Ok(builder.build()?)
}
