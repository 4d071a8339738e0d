mod config;

use std::sync::Arc;

use tracing::{info, warn};

use ember_db::Database;
use ember_session::{Session, SessionState};

use crate::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember=debug".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let db = Arc::new(Database::open(&config.db_path)?);
    let session = Session::connect(&config.api_url, db)?;

    let state = match session.init().await {
        Ok(state) => state,
        Err(e) => {
            warn!("Stored session unusable: {}", e);
            session.state()
        }
    };

    if !state.is_authenticated() {
        let Some((username, password)) = &config.login else {
            anyhow::bail!("no stored session; set EMBER_USERNAME and EMBER_PASSWORD");
        };
        session.login_with_password(username, password).await?;
    }
    if let Some(user) = session.user() {
        info!(username = %user.username, complete = user.is_complete(), "Signed in");
    }

    let feed = session.open_notifications();
    let mut unread = session.watch_unread();
    let mut session_state = session.watch_state();
    info!(unread = unread.current(), "Listening for notifications");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            total = unread.changed() => match total {
                Some(total) => info!(unread = total, "Unread messages"),
                None => break,
            },
            changed = session_state.changed() => {
                if changed.is_err() {
                    break;
                }
                if *session_state.borrow_and_update() == SessionState::Unauthenticated {
                    warn!("Session ended by server");
                    break;
                }
            }
        }
    }

    drop(feed);
    if config.logout_on_exit {
        session.logout().await;
    } else {
        session.channels().close_all().await;
    }
    Ok(())
}
