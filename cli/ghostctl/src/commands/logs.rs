//! Logs command (view application logs).

use anyhow::Result;
use clap::Args;

use super::CommandContext;

/// Logs command - view application logs.
#[derive(Debug, Args)]
pub struct LogsCommand {
    /// Process type to filter logs (optional).
    #[arg(long, short)]
    process: Option<String>,

    /// Instance ID to filter logs (optional).
    #[arg(long, short)]
    instance: Option<String>,

    /// Number of lines to show (default: 100).
    #[arg(long, short, default_value = "100")]
    lines: u32,

    /// Follow logs in real-time.
    #[arg(long, short)]
    follow: bool,

    /// Show timestamps.
    #[arg(long, short)]
    timestamps: bool,
}

impl LogsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let org_id = ctx.require_org()?;
        let app_id = ctx.require_app()?;
        let env_id = ctx
            .resolve_env()
            .ok_or_else(|| anyhow::anyhow!("No environment specified. Use --env or set a default context."))?;

        // TODO: Implement log streaming
        // This will connect to the log aggregation endpoint and stream logs
        // For now, we show a placeholder message

        println!("Logs for {}/{}/{}", org_id, app_id, env_id);
        if let Some(ref process) = self.process {
            println!("  Process: {}", process);
        }
        if let Some(ref instance) = self.instance {
            println!("  Instance: {}", instance);
        }
        println!("  Lines: {}", self.lines);
        println!("  Follow: {}", self.follow);
        println!("  Timestamps: {}", self.timestamps);
        println!();
        println!("Log streaming is not yet implemented.");
        println!("This feature will be available in a future release.");

        Ok(())
    }
}
