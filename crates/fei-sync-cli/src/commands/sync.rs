use anyhow::Result;
use colored::Colorize;
use fei_sync::{SyncSettings, SyncTarget};

use super::{print_report, Session};

pub async fn execute(settings: &SyncSettings, target: SyncTarget, refresh: bool) -> Result<()> {
    println!("{}", format!("Syncing {target}...").green().bold());
    println!();

    let session = Session::open(settings).await?;
    session.check_connection().await;

    let report = if refresh && target == SyncTarget::All {
        session.engine.on_manual_refresh().await
    } else {
        let mut report = session.engine.sync(target).await;
        if refresh {
            report
                .steps
                .extend(session.engine.sync(SyncTarget::FeiBuckets).await.steps);
        }
        report
    };

    print_report(&report);
    println!();

    if report.skipped_offline() {
        println!("{}", "Nothing synced, cached data is unchanged".yellow());
    } else if report.is_success() {
        println!("{}", "Sync complete".green().bold());
    } else {
        println!("{}", "Sync finished with errors, cached data kept".yellow().bold());
    }

    Ok(())
}
