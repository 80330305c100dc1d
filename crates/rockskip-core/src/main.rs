use anyhow::Result;
use clap::Parser;

use rockskip::cli::{Cli, Commands};
use rockskip::config::RockskipConfig;
use rockskip::search::SearchParams;
use rockskip::service::{self, server};
use rockskip::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            service::serve(args).await?;
        }
        Commands::Index(args) => {
            telemetry::init()?;
            let config = RockskipConfig::try_from_args(args.common)?;
            let rockskip = server::build(&config).await?;
            let indexed = rockskip.index(&args.repo, &args.commit, None).await?;
            println!("{}", serde_json::json!({ "indexed_commits": indexed }));
        }
        Commands::Search(args) => {
            telemetry::init()?;
            let config = RockskipConfig::try_from_args(args.common)?;
            let rockskip = server::build(&config).await?;
            let symbols = rockskip
                .search(SearchParams {
                    repo: args.repo,
                    commit: args.commit,
                    query: args.query,
                    is_regexp: args.regexp,
                    is_case_sensitive: args.case_sensitive,
                    include_patterns: args.include_patterns,
                    exclude_pattern: args.exclude_pattern,
                    limit: Some(args.limit),
                    timeout: None,
                })
                .await?;
            let json = serde_json::to_string_pretty(&symbols)?;
            println!("{json}");
        }
    }
    Ok(())
}
