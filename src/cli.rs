use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vortex-agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Rebalance cluster capacity between spot and on-demand pools")]
#[command(
    long_about = "A Kubernetes control-plane agent that forecasts spot interruption risk, \
chooses a target spot:on-demand ratio per workload pool, and executes it by steering \
provisioner weights, scaling sibling capacity groups, and draining risky nodes — without \
violating workload disruption contracts."
)]
pub struct Cli {
    /// Path to the agent configuration file (JSON)
    #[arg(short, long, env = "SPOTVORTEX_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding the model bundle (tft.onnx, rl_policy.onnx, ...)
    #[arg(long, env = "SPOTVORTEX_MODELS_DIR", value_name = "DIR")]
    pub models_dir: Option<PathBuf>,

    /// Prometheus base URL for metrics and prices
    #[arg(long, env = "SPOTVORTEX_PROMETHEUS_URL", value_name = "URL")]
    pub prometheus_url: Option<String>,

    /// Log and short-circuit every mutation
    #[arg(long)]
    pub dry_run: bool,

    /// Observe and report potential savings without acting
    #[arg(long)]
    pub shadow: bool,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    pub fn init_logging(&self) {
        if self.quiet {
            return;
        }

        let level = match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };

        env_logger::Builder::from_default_env()
            .filter_level(level)
            .init();
    }

    /// Fold CLI overrides into the loaded configuration.
    pub fn apply_to(&self, config: &mut crate::config::AgentConfig) {
        if let Some(dir) = &self.models_dir {
            config.models_dir = dir.clone();
        }
        if let Some(url) = &self.prometheus_url {
            config.telemetry.prometheus_url = url.clone();
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if self.shadow {
            config.shadow_mode = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["vortex-agent", "--dry-run", "--shadow"]);
        let mut config = crate::config::AgentConfig::default();
        cli.apply_to(&mut config);
        assert!(config.dry_run);
        assert!(config.shadow_mode);
    }

    #[test]
    fn test_flag_defaults_do_not_clobber_config() {
        let cli = Cli::parse_from(["vortex-agent"]);
        let mut config = crate::config::AgentConfig {
            dry_run: true,
            ..Default::default()
        };
        cli.apply_to(&mut config);
        assert!(config.dry_run);
    }
}
