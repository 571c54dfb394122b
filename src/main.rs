use portal_link::auth::*;
use portal_link::domain_model::ConnectionNotice;
use portal_link::domain_port::SessionStore;
use portal_link::http::*;
use portal_link::infra::*;
use portal_link::logger::*;
use portal_link::realtime::*;
use portal_link::settings::*;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    info!(?project_settings);
    logger.reload_from_config(&LogConfig::from(&project_settings.log))?;

    let store: Arc<dyn SessionStore> =
        Arc::new(FileSessionStore::new(&project_settings.session.path));
    let session = SessionHandle::restore(store).await?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Get { path } => get(&project_settings, session, &path).await,
        Command::Watch => watch(&project_settings, session).await,
        Command::Logout => logout(session).await,
    }
}

async fn get(settings: &Settings, session: SessionHandle, path: &str) -> anyhow::Result<()> {
    let client = ApiClient::new(&ApiConfig::from(&settings.api), session)?;
    let mut logouts = client.tokens().subscribe_logout();

    match client.get::<serde_json::Value>(path).await {
        Ok(data) => {
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
        Err(e) => {
            if let Ok(event) = logouts.try_recv() {
                warn!(reason = ?event.reason, "{}, sign in again at {}", event.message, event.redirect_to);
            }
            Err(e.into())
        }
    }
}

async fn watch(settings: &Settings, session: SessionHandle) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(
        RealtimeConfig::from(&settings.realtime),
        Arc::new(WsConnector::default()),
        session,
    );
    let notifications = Arc::new(NotificationStore::new());
    notifications.install(manager.router());

    let mut transitions = manager.subscribe_transitions();
    let mut notices = manager.subscribe_notices();
    let mut feed = notifications.subscribe();

    manager.connect().await?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            Ok(state) = transitions.recv() => info!(%state, "realtime status"),
            Ok(notice) = notices.recv() => match notice {
                ConnectionNotice::Connected => info!("realtime notifications enabled"),
                ConnectionNotice::ReconnectingWarning => warn!("connection lost, trying to reconnect..."),
                ConnectionNotice::ReconnectingCleared => info!("connection restored"),
            },
            Ok(notification) = feed.recv() => {
                info!(level = ?notification.level, title = %notification.title, "{}", notification.message);
            }
        }
    }

    manager.dispose().await;
    Ok(())
}

async fn logout(session: SessionHandle) -> anyhow::Result<()> {
    if session.clear().await {
        info!("session cleared");
    } else {
        info!("no session to clear");
    }
    Ok(())
}
