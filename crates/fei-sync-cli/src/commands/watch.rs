use anyhow::Result;
use colored::Colorize;
use fei_sync::SyncSettings;

use super::{print_report, Session};

pub async fn execute(settings: &SyncSettings) -> Result<()> {
    println!("{}", "Watching connectivity (Ctrl+C to stop)".green().bold());
    println!();

    let session = Session::open(settings).await?;
    let engine = session.engine.clone();

    if session.check_connection().await {
        print_report(&engine.on_start().await);
    }

    let sync_loop = engine.spawn_connectivity_loop();
    let probe = tokio::spawn(session.probe.run());

    let mut states = engine.monitor().subscribe();
    let mut store_events = engine.store().subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state.is_online() {
                    println!("{} online", "●".green());
                } else if state.degraded {
                    println!("{} connection too poor, staying offline", "●".yellow());
                } else {
                    println!("{} offline", "●".red());
                }
            }
            event = store_events.recv() => {
                if let Ok(event) = event {
                    tracing::debug!(keys = ?event.keys, revision = event.revision, "cache updated");
                }
            }
        }
    }

    probe.abort();
    sync_loop.abort();
    println!();
    println!("{}", "Stopped".green());

    Ok(())
}
