use {
    anyhow::Result,
    clap::Subcommand,
    statusbot_config::StatusbotConfig,
    statusbot_whatsapp::{CredentialStore, Identity, SessionOptions},
};

#[derive(Subcommand)]
pub enum SessionAction {
    /// List numbers with stored credentials.
    List,
    /// Delete a number's credentials so it has to pair again.
    Reset {
        /// Phone number with country code.
        number: String,
    },
}

pub async fn handle_sessions(action: SessionAction, config: &StatusbotConfig) -> Result<()> {
    let store = open_store(config)?;
    match action {
        SessionAction::List => list(&store).await,
        SessionAction::Reset { number } => reset(&store, &number).await,
    }
}

fn open_store(config: &StatusbotConfig) -> Result<CredentialStore> {
    let options = SessionOptions::from_config(&config.whatsapp);
    Ok(CredentialStore::open(options.data_dir)?)
}

async fn list(store: &CredentialStore) -> Result<()> {
    let identities = store.identities()?;
    if identities.is_empty() {
        println!("No stored sessions in {}", store.root().display());
        return Ok(());
    }
    for identity in identities {
        let bundle = store.load(&identity).await?;
        let status = if bundle.registered {
            "registered"
        } else {
            "pending"
        };
        match bundle.me {
            Some(me) => println!("{identity}  {status}  {me}"),
            None => println!("{identity}  {status}"),
        }
    }
    Ok(())
}

async fn reset(store: &CredentialStore, number: &str) -> Result<()> {
    let identity = Identity::parse(number)?;
    store.reset(&identity).await?;
    println!("Removed stored credentials for {identity}");
    Ok(())
}
