//! CLI command definitions and dispatch for the `pflow` binary.
//!
//! Uses clap derive macros for argument parsing. Instance commands take the
//! instance id as their only positional argument (e.g. `pflow pause <id>`).

pub mod instance;
pub mod template;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use phaseflow_core::repository::StorageArea;
use phaseflow_types::instance::InstanceOptions;

/// Drive durable, phase-based workflows.
#[derive(Parser)]
#[command(name = "pflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory (defaults to $PHASEFLOW_DATA_DIR, then ~/.phaseflow).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory of template files (defaults to {data_dir}/templates).
    #[arg(long, global = true)]
    pub templates: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an instance of a template, start it and execute its phases.
    Run {
        /// Template id.
        template: String,

        /// Execute at most this many phases, then leave the instance running.
        #[arg(long)]
        phases: Option<usize>,

        #[command(flatten)]
        options: OptionArgs,
    },

    /// Create and start an instance without executing any phase.
    Start {
        /// Template id.
        template: String,

        #[command(flatten)]
        options: OptionArgs,
    },

    /// Execute the current phase of a running instance.
    Next {
        /// Instance id.
        id: String,
    },

    /// Run the validation gates of the current phase without executing it.
    Validate {
        /// Instance id.
        id: String,
    },

    /// List instances.
    #[command(alias = "ls")]
    List {
        /// Filter live instances by status (running, paused, completed, ...).
        #[arg(long)]
        status: Option<String>,

        /// Filter live instances by template id.
        #[arg(long)]
        template: Option<String>,

        /// List stored snapshots in a storage area instead (active, completed,
        /// failed, archived).
        #[arg(long, conflicts_with_all = ["status", "template"])]
        area: Option<String>,
    },

    /// Show details of an instance.
    Show {
        /// Instance id.
        id: String,
    },

    /// Aggregate statistics over live instances.
    Stats,

    /// Pause a running instance.
    Pause {
        /// Instance id.
        id: String,
    },

    /// Resume a paused instance.
    Resume {
        /// Instance id.
        id: String,
    },

    /// Cancel an instance.
    Cancel {
        /// Instance id.
        id: String,

        /// Reason recorded with the cancellation.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Remove an instance and delete (or archive) its storage folder.
    #[command(alias = "rm")]
    Remove {
        /// Instance id.
        id: String,

        /// Move the folder to the archived area instead of deleting it.
        #[arg(long)]
        archive: bool,
    },

    /// List available workflow templates.
    Templates,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Instance options shared by `run` and `start`.
#[derive(Args, Debug, Default)]
pub struct OptionArgs {
    /// Free-form label stored with the instance.
    #[arg(long)]
    pub label: Option<String>,

    /// Who started the instance.
    #[arg(long = "by")]
    pub initiated_by: Option<String>,

    /// Extra option passed to action handlers (KEY=VALUE, repeatable).
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub extra: Vec<String>,
}

impl OptionArgs {
    /// Build instance options. Values that parse as JSON keep their type,
    /// anything else is stored as a string.
    pub fn into_options(self) -> Result<InstanceOptions> {
        let mut options = InstanceOptions {
            label: self.label,
            initiated_by: self.initiated_by,
            ..InstanceOptions::default()
        };
        for pair in self.extra {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("invalid option '{pair}': expected KEY=VALUE");
            };
            let key = key.trim();
            if key.is_empty() {
                bail!("invalid option '{pair}': empty key");
            }
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            options.extra.insert(key.to_string(), value);
        }
        Ok(options)
    }
}

/// Parse a storage area name.
pub fn parse_area(name: &str) -> Result<StorageArea> {
    StorageArea::ALL
        .into_iter()
        .find(|area| area.dir_name().eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            anyhow::anyhow!("invalid storage area '{name}' (active, completed, failed, archived)")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn option_args_build_options() {
        let args = OptionArgs {
            label: Some("nightly".to_string()),
            initiated_by: None,
            extra: vec![
                "retries=3".to_string(),
                "target=staging".to_string(),
                "flags={\"dry\":true}".to_string(),
            ],
        };
        let options = args.into_options().unwrap();
        assert_eq!(options.label.as_deref(), Some("nightly"));
        assert_eq!(options.extra["retries"], serde_json::json!(3));
        assert_eq!(options.extra["target"], serde_json::json!("staging"));
        assert_eq!(options.extra["flags"]["dry"], serde_json::json!(true));
    }

    #[test]
    fn option_args_reject_malformed_pairs() {
        let args = OptionArgs {
            extra: vec!["novalue".to_string()],
            ..OptionArgs::default()
        };
        assert!(args.into_options().is_err());
    }

    #[test]
    fn parses_areas() {
        assert_eq!(parse_area("Completed").unwrap(), StorageArea::Completed);
        assert!(parse_area("elsewhere").is_err());
    }

    #[test]
    fn parses_run_with_options() {
        let cli = Cli::try_parse_from([
            "pflow", "run", "t1", "--phases", "1", "--set", "a=b", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                template,
                phases,
                options,
            } => {
                assert_eq!(template, "t1");
                assert_eq!(phases, Some(1));
                assert_eq!(options.extra, vec!["a=b"]);
            }
            _ => panic!("expected run"),
        }
    }
}
