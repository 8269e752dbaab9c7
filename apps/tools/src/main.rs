use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{GuildId, RemoteUserId};
use storage::{BridgeStore, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/bridge.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    ListUsers,
    ListGuilds {
        #[arg(long)]
        owner: String,
    },
    SetGuildBridging {
        owner: String,
        guild_id: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ListUsers => {
            for user in storage.get_all_users().await? {
                println!(
                    "{}\tremote_id={}\tlogged_in={}",
                    user.mxid,
                    user.remote_id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
                    user.token.as_deref().is_some_and(|t| !t.is_empty()),
                );
            }
        }
        Command::ListGuilds { owner } => {
            let owner = RemoteUserId::from(owner);
            for membership in storage.get_guild_memberships(&owner).await? {
                println!(
                    "{}\t{}\tbridge={}",
                    membership.guild_id, membership.guild_name, membership.bridge
                );
            }
        }
        Command::SetGuildBridging {
            owner,
            guild_id,
            enabled,
        } => {
            let owner = RemoteUserId::from(owner);
            let guild_id = GuildId::from(guild_id);
            if !storage
                .set_guild_bridging(&owner, &guild_id, enabled)
                .await?
            {
                bail!("{owner} has no membership in guild {guild_id}");
            }
            println!("guild {guild_id} bridge={enabled} for {owner}");
        }
    }

    Ok(())
}
