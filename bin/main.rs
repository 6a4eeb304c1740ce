use mailgate::{config::Config, hooks::AcceptAll, logging, server::Server};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    let server = Server::new(config, AcceptAll)?;

    let (shutdown, receiver) = broadcast::channel(1);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(mailgate::server::Signal::Shutdown);
        }
    });

    server.serve(receiver).await?;

    Ok(())
}
