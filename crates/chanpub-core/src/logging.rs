use crate::{errors::Error, Result};

/// Initialize tracing for the service.
///
/// `RUST_LOG` overrides the default filter. `LOG_FORMAT=json` switches to one
/// JSON object per line for log shippers.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    // Default: info for our crates, warn for everything else.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,chanpub=info,chanpub_core=info,chanpub_gateway=info,chanpub_translate=info,chanpub_telegram=info,{}=info",
            service_name.replace('-', "_")
        ))
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let res = if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(true)
            .try_init()
    };

    res.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
