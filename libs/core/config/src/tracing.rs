use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre with the project-standard hook.
///
/// Shows the file:line where errors occur and hides the environment section.
/// Safe to call multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Default filter directives when `RUST_LOG` is not set.
fn default_directives(environment: &Environment) -> &'static str {
    if environment.is_production() {
        "info,lapin=warn,reqwest=warn"
    } else {
        "debug,lapin=info,hyper=info,reqwest=info"
    }
}

/// Initialize tracing for a long-running service.
///
/// - **Production** (`APP_ENV=production`): flattened JSON lines for log shipping,
///   module targets hidden.
/// - **Development** (default): pretty, human-readable output.
///
/// Both install `tracing_error::ErrorLayer` so eyre reports carry span traces.
/// `RUST_LOG` overrides the default directives.
///
/// Calling it more than once is harmless (tests do).
pub fn init_tracing(service: &str, environment: &Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(environment)));

    let result = if environment.is_production() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => info!(service = %service, environment = ?environment, "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized, skipping re-initialization"),
    }
}
