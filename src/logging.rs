use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// Installs the global `tracing` subscriber. Logs go to stderr; the job's
/// own output only ever goes to viewers and the output log.
pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::init_logging;
    use crate::config::Config;
    use clap::Parser;

    #[test]
    fn bad_filter_falls_back_and_second_init_fails() {
        let cfg = Config::parse_from(["task-agent", "--log-level", "[[[", "true"]);
        assert!(init_logging(&cfg).is_ok());
        assert!(init_logging(&cfg).is_err());
    }
}
