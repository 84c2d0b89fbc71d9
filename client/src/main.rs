use anyhow::Context;
use clap::Parser;
use roulette_client::cli::{Args, Command};
use roulette_client::media::{LocalMedia, MediaProvider, SampleTrackProvider};
use roulette_client::session::{Session, SessionEvent};
use roulette_client::signaling::SignalingClient;
use roulette_client::transport::WebrtcTransportFactory;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let args = Args::parse();
    let config = args.load_config().context("could not load configuration")?;

    let provider = SampleTrackProvider::new(!args.no_audio, !args.no_video);
    let (media, media_event) = match provider.acquire().await {
        Ok(media) => (media, SessionEvent::MediaReady),
        Err(err) => (LocalMedia::default(), SessionEvent::MediaDenied(err.to_string())),
    };
    let factory = WebrtcTransportFactory::new(&config.ice, media)?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let (session, handle, mailbox) =
        Session::new(factory, config.session.policy(), outbound_tx, status_tx);
    handle.send(media_event);

    let mut signaling = tokio::spawn(
        SignalingClient::new(args.server.clone(), config.signaling.clone())
            .run(handle.mailbox(), outbound_rx),
    );
    let session_task = tokio::spawn(session.run(mailbox));

    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            if status.is_blocking() {
                tracing::warn!("{status}");
            } else {
                tracing::info!("{status}");
            }
        }
    });

    println!("Commands: next (n), quit (q)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let outcome = loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match Command::parse(&line) {
                    Some(Command::Next) => handle.request_next(),
                    Some(Command::Quit) => break Ok(()),
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command: {}", line.trim()),
                },
                // Keep running headless until ctrl-c
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
            result = &mut signaling => break result.context("signaling task panicked")?,
        }
    };

    handle.shutdown();
    session_task.await.context("session task panicked")?;
    outcome.context("signaling connection gave up")
}
