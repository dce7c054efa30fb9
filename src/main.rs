use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use groupscope_lib::config::{load_config, load_config_from, Config};
use groupscope_lib::error::{ErrorReport, PipelineError};
use groupscope_lib::key::{derive_key, source_db_dir_name};
use groupscope_lib::pipeline::{import_structured, run_import, ImportRequest, Stage};
use groupscope_lib::store::AccountStore;
use groupscope_lib::Decryptor;

#[derive(Parser)]
#[command(name = "groupscope")]
#[command(about = "Import encrypted group databases and analyse group membership")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to ~/.groupscope/config.json)
    #[arg(long, global = true, env = "GROUPSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StageArg {
    Raw,
    Cleaned,
    Decrypted,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Raw => Stage::Raw,
            StageArg::Cleaned => Stage::Cleaned,
            StageArg::Decrypted => Stage::Decrypted,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the decryption key for a raw group_info.db
    Key {
        /// Installation id of the client
        installation_id: String,
        /// Raw encrypted file
        file: PathBuf,
    },

    /// Run the import pipeline for an account
    Import {
        account_id: String,
        /// Stage the input is already at
        #[arg(long, value_enum, default_value = "raw")]
        stage: StageArg,
        /// File to copy into the stage's slot before running
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        installation_id: Option<String>,
        /// Explicit key; wins over --installation-id
        #[arg(long)]
        key: Option<String>,
        /// Remove intermediate files after a successful import
        #[arg(long)]
        cleanup: bool,
    },

    /// Load a structured JSON upload for an account
    ImportJson { account_id: String, file: PathBuf },

    /// List accounts with an analysis database
    Accounts,

    /// Show counts and the last import for an account
    Summary { account_id: String },

    /// Delete an account and all of its files
    Delete { account_id: String },

    /// Search groups by name
    Search {
        account_id: String,
        #[arg(default_value = "")]
        query: String,
    },

    /// Users in at least N groups
    Frequent {
        account_id: String,
        #[arg(long, default_value_t = 2)]
        min_groups: usize,
    },

    /// Members of a group who are also in other groups
    Overlap { account_id: String, group_id: String },

    /// Users present in every listed group
    Intersect {
        account_id: String,
        group_ids: Vec<String>,
    },

    /// Groups a user belongs to
    UserGroups { account_id: String, user_id: String },
}

fn resolve_config(cli: &Cli) -> Result<Config, String> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PipelineError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::InvalidInput(format!("cannot render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyOutput {
    key: String,
    source_dir: String,
}

fn execute(command: Commands, config: &Config) -> Result<(), PipelineError> {
    let store = AccountStore::new(config);

    match command {
        Commands::Key { installation_id, file } => print_json(&KeyOutput {
            key: derive_key(&installation_id, &file)?,
            source_dir: source_db_dir_name(&installation_id),
        }),
        Commands::Import {
            account_id,
            stage,
            source,
            installation_id,
            key,
            cleanup,
        } => {
            let decryptor = Decryptor::from_config(config);
            let request = ImportRequest {
                account_id,
                stage: stage.into(),
                installation_id,
                key,
                source,
                cleanup,
            };
            print_json(&run_import(&store, &decryptor, &request)?)
        }
        Commands::ImportJson { account_id, file } => {
            let bytes = std::fs::read(&file).map_err(|e| PipelineError::SourceFile {
                path: file.clone(),
                reason: "cannot read JSON upload".to_string(),
                source: Some(e),
            })?;
            print_json(&import_structured(&store, &account_id, &bytes)?)
        }
        Commands::Accounts => print_json(&store.list_accounts()?),
        Commands::Summary { account_id } => print_json(&store.account_summary(&account_id)?),
        Commands::Delete { account_id } => {
            store.delete_account(&account_id)?;
            print_json(&serde_json::json!({ "deleted": account_id }))
        }
        Commands::Search { account_id, query } => {
            print_json(&store.query(&account_id)?.search_groups(&query)?)
        }
        Commands::Frequent {
            account_id,
            min_groups,
        } => print_json(&store.query(&account_id)?.frequent_users(min_groups)?),
        Commands::Overlap {
            account_id,
            group_id,
        } => print_json(&store.query(&account_id)?.group_overlap(&group_id)?),
        Commands::Intersect {
            account_id,
            group_ids,
        } => print_json(&store.query(&account_id)?.intersection(&group_ids)?),
        Commands::UserGroups {
            account_id,
            user_id,
        } => print_json(&store.query(&account_id)?.user_groups(&user_id)?),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {}", e);
            process::exit(2);
        }
    };

    if let Err(e) = execute(cli.command, &config) {
        let report = ErrorReport::from(&e);
        log::error!("{}", report.message);
        eprintln!("Suggestion: {}", report.recovery_suggestion);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_flag_and_subcommand_parse() {
        let cli = Cli::try_parse_from([
            "groupscope",
            "--config",
            "/tmp/groupscope.json",
            "intersect",
            "1000",
            "G1",
            "G2",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/groupscope.json")));
        match cli.command {
            Commands::Intersect { account_id, group_ids } => {
                assert_eq!(account_id, "1000");
                assert_eq!(group_ids, vec!["G1", "G2"]);
            }
            _ => panic!("expected intersect"),
        }
    }

    #[test]
    fn test_import_stage_defaults_to_raw() {
        let cli = Cli::try_parse_from(["groupscope", "import", "1000", "--key", "k"]).unwrap();
        match cli.command {
            Commands::Import { stage, key, cleanup, .. } => {
                assert!(matches!(Stage::from(stage), Stage::Raw));
                assert_eq!(key.as_deref(), Some("k"));
                assert!(!cleanup);
            }
            _ => panic!("expected import"),
        }
    }
}
