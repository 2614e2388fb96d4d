use tracing::{info, warn};

mod commands;
mod error;
mod settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (settings, command) = settings::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "spese={level},data_access={level}",
            level = settings.log_level
        ))
        .with_writer(std::io::stderr)
        .init();

    let client = data_access::connect(&settings.connection())?;
    match (&settings.email, &settings.password) {
        (Some(email), Some(password)) => {
            let session = client.sign_in(email, password).await?;
            info!(user = %session.user.id, "signed in");
        }
        (Some(_), None) => warn!("email set but SPESE_PASSWORD is not; continuing signed out"),
        _ => {}
    }

    let outcome = commands::run(&client, command).await;

    if client.session().is_some()
        && let Err(err) = client.sign_out().await
    {
        warn!("failed to sign out: {err}");
    }

    Ok(outcome?)
}
