use anyhow::Result;
use clap::{Parser, Subcommand};

use rusty_patch::app::PatchApp;
use rusty_patch::config::Settings;
use rusty_patch::observability::init_logging;

#[derive(Parser, Debug)]
#[command(name = "rusty-patch")]
#[command(about = "Multi-process patch loader", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate runtime config and trusted key loading.
    Doctor,
    /// Run the patch load pass once and print its outcome.
    Load,
    /// Show the version ledger as JSON.
    Ledger,
    /// Verify a patch bundle signature and manifest without loading it.
    Verify {
        /// Patch version to verify. Defaults to the ledger's new version.
        #[arg(long)]
        version: Option<String>,
    },
    /// Inspect or reset the safe-mode counter of this process.
    SafeMode {
        #[command(subcommand)]
        command: SafeModeCommands,
    },
    /// Load the patch, then resolve one name through the installed chain.
    Resolve { name: String },
    /// Show the published load outcome summary.
    Report,
}

#[derive(Subcommand, Debug)]
enum SafeModeCommands {
    /// Show the current counter.
    Status,
    /// Acknowledge a healthy start and reset the counter.
    Reset {
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    let _logging = init_logging();
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let app = PatchApp::new(settings)?;

    match cli.command.unwrap_or(Commands::Doctor) {
        Commands::Doctor => {
            let report = app.doctor();
            println!("Rusty Patch Doctor");
            println!("app_id: {}", report.app_id);
            println!("process_name: {}", report.process_name);
            println!("data_dir: {}", report.data_dir.display());
            println!("patch_root: {}", report.patch_root.display());
            println!("outcome_dir: {}", report.outcome_dir.display());
            println!("app_dir: {}", report.app_dir.display());
            println!("enabled: {}", report.enabled);
            println!("enable_code: {}", report.subsystems.code);
            println!("enable_alt_runtime: {}", report.subsystems.alt_runtime);
            println!("enable_native: {}", report.subsystems.native);
            println!("enable_resources: {}", report.subsystems.resources);
            println!("safe_mode_max_count: {}", report.safe_mode_max_count);
            println!("trusted_key_loaded: {}", report.trusted_key_loaded);
            println!("trusted_key_valid: {}", report.trusted_key_valid);
            println!(
                "base_id: {}",
                report.base_id.unwrap_or_else(|| "<unset>".to_string())
            );
            println!("lookup_order: {}", report.lookup_order.as_str());
            println!("use_delegate_last: {}", report.use_delegate_last);
            println!("kill_siblings: {}", report.kill_siblings);
            println!("capability_level: {}", report.capability_level);
            println!("platform_fingerprint: {}", report.platform_fingerprint);
            println!("alt_runtime_active: {}", report.alt_runtime_active);
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
        }
        Commands::Load => println!("{}", app.load_json()?),
        Commands::Ledger => println!("{}", app.ledger_json()?),
        Commands::Verify { version } => println!("{}", app.verify_json(version.as_deref())?),
        Commands::SafeMode { command } => match command {
            SafeModeCommands::Status => println!("{}", app.safe_mode_status_json()?),
            SafeModeCommands::Reset { confirm } => {
                println!("{}", app.safe_mode_reset_json(confirm)?)
            }
        },
        Commands::Resolve { name } => println!("{}", app.resolve_json(&name)?),
        Commands::Report => println!("{}", app.report_json()?),
    }

    Ok(())
}
