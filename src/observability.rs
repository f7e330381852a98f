use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub struct ObservabilityGuard {
    installed: bool,
}

impl ObservabilityGuard {
    pub fn init() -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .is_ok();
        if !installed {
            eprintln!(
                "{{\"event\":\"observability_init\",\"status\":\"degraded\",\"message\":\"a global subscriber is already installed\"}}"
            );
        }
        Self { installed }
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

pub fn init_logging() -> ObservabilityGuard {
    ObservabilityGuard::init()
}
