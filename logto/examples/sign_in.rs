use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use logto::{storage::FileStorage, CallbackRequest, LogtoClient, LogtoConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(about = "Signs in to Logto from the terminal")]
struct Opts {
    /// The redirect URI registered for the application
    #[arg(long, env, default_value = "http://localhost:3000/callback")]
    redirect_uri: String,

    /// An API resource to request a token for after signing in
    #[arg(long, env)]
    resource: Option<String>,

    /// The local file used to hold session state
    #[arg(short = 'f', long, env, default_value = ".logto-session.json")]
    session_file: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = LogtoConfig::from_env()?;
    let storage = Arc::new(FileStorage::new(opts.session_file));
    let client = LogtoClient::discover(config, storage).await?;

    if !client.is_authenticated().await? {
        let url = client.sign_in(&opts.redirect_uri, None).await?;
        println!("Open this URL in a browser and sign in:\n\n  {}\n", url);
        println!("Then paste the full URL you were redirected to:");

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;

        let callback_url: url::Url = line.trim().parse()?;
        let callback = CallbackRequest::from_url(&callback_url)
            .ok_or_else(|| color_eyre::eyre::eyre!("callback URL has no host"))?;
        client.handle_sign_in_callback(&callback).await?;
    }

    let claims = client.id_token_claims().await?;
    tracing::info!(sub = %claims.sub, name = ?claims.name, "signed in");

    let user_info = client.fetch_user_info().await?;
    tracing::info!(?user_info, "fetched user info");

    if let Some(resource) = opts.resource {
        let token = client.access_token(&resource).await?;
        tracing::info!(
            %resource,
            token = format_args!("{:#?}", token),
            "access token for resource"
        );
    }

    Ok(())
}
