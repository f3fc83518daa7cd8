use anyhow::Result;
use colored::Colorize;
use fei_sync::{
    CacheStore, Carcasse, CarcasseIntermediaire, CollectionName, Entity, Fei, OutboundQueue,
    SyncSettings, TrackedRecord, User,
};

pub async fn execute(settings: &SyncSettings) -> Result<()> {
    // Read-only: no engine, no network
    let store = CacheStore::from_backend(&settings.store).await?;
    let queue = OutboundQueue::new(store.clone(), settings.sync.queue_max);

    println!("{}", "Local cache".green().bold());
    println!();
    println!("Backend: {}", store.backend_name().cyan());
    if store.is_degraded() {
        println!("{}", "⚠ persistence failed, data is in memory only".yellow());
    }

    match store.profile() {
        Some(user) => println!(
            "Profile: {} ({})",
            user.email.as_deref().unwrap_or(&user.id).cyan(),
            user.roles.join(", ")
        ),
        None => println!("Profile: {}", "not cached".yellow()),
    }
    println!();

    print_collection::<Entity>(&store);
    print_collection::<User>(&store);
    print_collection::<Fei>(&store);
    print_collection::<Carcasse>(&store);
    print_collection::<CarcasseIntermediaire>(&store);
    println!();

    let pending = queue.pending();
    println!("Outbound queue: {}", pending.len().to_string().cyan());
    for mutation in pending.iter().take(10) {
        println!(
            "  {} {} {} (queued {})",
            mutation.kind.to_string().yellow(),
            mutation.collection,
            mutation.record_key,
            mutation.queued_at.to_rfc3339()
        );
    }
    if pending.len() > 10 {
        println!("  ... and {} more", pending.len() - 10);
    }

    Ok(())
}

fn print_collection<T: TrackedRecord>(store: &CacheStore) {
    let collection = T::COLLECTION;
    let count = store.collection::<T>().len();
    let mark = match store.mark(collection) {
        Some(mark) => mark.to_rfc3339(),
        None if collection == CollectionName::Entities || collection == CollectionName::Users => {
            "full refresh".to_string()
        }
        None => "never synced".to_string(),
    };

    println!("  {:<26} {:>6}   {}", collection.to_string().cyan(), count, mark);
}
