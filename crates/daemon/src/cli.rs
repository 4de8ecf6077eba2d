use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use plantwire_infra::PlantwireConfig;
use plantwire_observability::LogFormat;

/// Plant telemetry simulator and streaming daemon.
#[derive(Debug, Parser)]
#[command(name = "plantwire", version, about)]
pub struct Cli {
    /// Configuration file; every section is optional.
    #[arg(short, long, env = "PLANTWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Validate configuration and master data, then exit.
    #[arg(long)]
    pub check_config: bool,

    /// Override `simulation.seed` (takes precedence over PLANTWIRE_SEED).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override `logging.format` (json, pretty, compact).
    #[arg(long)]
    pub log_format: Option<LogFormat>,
}

impl Cli {
    /// File (or defaults), then environment, then command-line overrides,
    /// then validation.
    pub fn load_config(&self) -> anyhow::Result<PlantwireConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                PlantwireConfig::from_toml_str(&text)?
            }
            None => PlantwireConfig::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        if let Some(seed) = self.seed {
            config.simulation.seed = Some(seed);
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from(["plantwire", "--check-config", "--seed", "42", "--log-format", "pretty"]).unwrap();
        assert!(cli.check_config);
        assert_eq!(cli.seed, Some(42));
        assert_eq!(cli.log_format, Some(LogFormat::Pretty));
    }

    #[test]
    fn seed_flag_overrides_the_file() {
        let cli = Cli::try_parse_from(["plantwire", "--seed", "9"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.simulation.seed, Some(9));
    }

    #[test]
    fn missing_file_is_reported() {
        let cli = Cli::try_parse_from(["plantwire", "--config", "/nonexistent/plantwire.toml"]).unwrap();
        let err = cli.load_config().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/plantwire.toml"));
    }
}
