use anyhow::Result;
use colored::Colorize;
use fei_sync::{SyncSettings, SyncTarget};

use super::{print_report, Session};

pub async fn execute(settings: &SyncSettings) -> Result<()> {
    let session = Session::open(settings).await?;
    let queue = session.engine.queue();

    if queue.is_empty() {
        println!("{}", "Outbound queue is empty".green());
        return Ok(());
    }

    println!("{}", format!("Pushing {} queued writes...", queue.len()).green().bold());
    println!();

    session.check_connection().await;
    let report = session.engine.sync(SyncTarget::Outbound).await;
    print_report(&report);

    Ok(())
}
