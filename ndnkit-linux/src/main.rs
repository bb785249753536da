// ndnkit for Linux: publish or subscribe to a topic over UDP multicast.

mod config;
mod udp_face;

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{bail, Context};
use ndnkit_core::{Face, Name, Publisher, Subscriber};
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: ndnkit publish <topic> | ndnkit subscribe <topic> | ndnkit --version";

enum Command {
    Publish(Name),
    Subscribe(Name),
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Command>> {
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(None);
    }
    match args {
        [cmd, topic] => {
            let topic: Name = topic.parse().with_context(|| format!("bad topic {:?}", topic))?;
            match cmd.as_str() {
                "publish" => Ok(Some(Command::Publish(topic))),
                "subscribe" => Ok(Some(Command::Subscribe(topic))),
                other => bail!("unknown command {:?}\n{}", other, USAGE),
            }
        }
        _ => bail!("{}", USAGE),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = parse_args(&args)? else {
        println!("ndnkit {}", VERSION);
        return Ok(());
    };
    init_tracing();
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(command, cfg))
}

async fn run(command: Command, cfg: config::Config) -> anyhow::Result<()> {
    let face = Arc::new(
        udp_face::UdpFace::bind(cfg.port, &cfg.multicast_group)
            .await
            .with_context(|| format!("binding {}:{}", cfg.multicast_group, cfg.port))?,
    );
    info!(group = %cfg.multicast_group, port = cfg.port, "face ready");

    let pump_face = face.clone();
    let interval = cfg.core.pump().interval.unwrap_or(std::time::Duration::from_millis(1));
    let pump_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = pump_face.pump() {
                error!(error = %e, "pump failed");
            }
        }
    });

    match command {
        Command::Publish(topic) => {
            let publisher = Publisher::new(face.clone(), topic.clone(), &cfg.core)?;
            publisher.open()?;
            info!(%topic, publisher_id = publisher.publisher_id(), "publishing lines from stdin");
            let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            std::thread::spawn(move || {
                for line in std::io::stdin().lock().lines().map_while(|l| l.ok()) {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    line = line_rx.recv() => match line {
                        Some(line) => match publisher.publish(line.into_bytes()) {
                            Ok(seq) => info!(sequence = seq, "published"),
                            Err(e) => warn!(error = %e, "publish failed"),
                        },
                        None => break,
                    },
                    res = &mut shutdown => { res?; break; }
                }
            }
            publisher.close()?;
            // Let the exit announcement go out.
            face.pump()?;
        }
        Command::Subscribe(topic) => {
            let subscriber = Subscriber::new(face.clone(), topic.clone(), &cfg.core)?;
            subscriber.open()?;
            subscriber.subscribe(
                |m| {
                    let text = String::from_utf8_lossy(&m.content);
                    println!("[{:016x} #{}] {}", m.publisher_id, m.sequence, text);
                },
                |e| error!(error = %e, "subscription error"),
            )?;
            info!(%topic, "subscribed");
            shutdown_signal().await?;
            subscriber.close();
        }
    }
    pump_task.abort();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert!(matches!(
            parse_args(&args(&["publish", "/chat"])),
            Ok(Some(Command::Publish(_)))
        ));
        assert!(matches!(
            parse_args(&args(&["subscribe", "/chat"])),
            Ok(Some(Command::Subscribe(_)))
        ));
        assert!(matches!(parse_args(&args(&["--version"])), Ok(None)));
        assert!(parse_args(&args(&["listen", "/chat"])).is_err());
        assert!(parse_args(&args(&[])).is_err());
    }
}
