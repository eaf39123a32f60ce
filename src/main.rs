use std::sync::Arc;

use cirrus::auth::session::KeyringVault;
use cirrus::auth::supabase::{SupabaseAuth, log_out, restore_session};
use cirrus::auth::{RestoreState, SessionGate};
use cirrus::cache::LocalStore;
use cirrus::config::CirrusConfig;
use cirrus::gateway::DataGateway;
use cirrus::remote::postgrest::PostgrestClient;

/// Journal logger that passes cirrus at info/debug (per config) and
/// everything else at warn.
struct FilteredJournal {
    inner: systemd_journal_logger::JournalLog,
}

impl log::Log for FilteredJournal {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        if metadata.target().starts_with("cirrus") {
            let max = if cirrus::debug_logging() {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            };
            metadata.level() <= max
        } else {
            metadata.level() <= log::LevelFilter::Warn
        }
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

// `journalctl --user -t cirrus -f`
fn init_logging(debug: bool) -> Result<(), Box<dyn std::error::Error>> {
    let journal =
        systemd_journal_logger::JournalLog::new()?.with_syslog_identifier("cirrus".to_string());
    cirrus::set_debug_logging(debug);
    log::set_boxed_logger(Box::new(FilteredJournal { inner: journal }))?;
    // Global max must be Debug so cirrus debug logs can pass through when toggled
    log::set_max_level(log::LevelFilter::Debug);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let refresh = args.iter().any(|a| a == "--refresh");
    let clear = args.iter().any(|a| a == "--clear");
    let logout = args.iter().any(|a| a == "--logout");

    let config = CirrusConfig::load();
    if let Err(e) = init_logging(config.debug_logging) {
        eprintln!("Journal logging unavailable: {}", e);
    }

    let store = Arc::new(LocalStore::open(&config.cache_dir));
    println!("=== Cirrus cache: {} ===\n", store.dir().display());

    if clear {
        if store.clear_all() {
            println!("Cache cleared.\n");
        } else {
            println!("Cache could not be fully cleared, see the journal.\n");
        }
    }

    if refresh || logout {
        if config.has_remote() {
            refresh_from_server(&config, store.clone(), logout).await?;
        } else {
            println!(
                "No server configured (set supabase_url and anon_key in {} or {}/{}).\n",
                CirrusConfig::path().display(),
                cirrus::config::URL_ENV,
                cirrus::config::ANON_KEY_ENV
            );
        }
    }

    print_stats(&store);
    Ok(())
}

async fn refresh_from_server(
    config: &CirrusConfig,
    store: Arc<LocalStore>,
    logout: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Server: {} ---", config.supabase_url);

    let vault = Arc::new(KeyringVault::new(&config.supabase_url));
    let auth = Arc::new(SupabaseAuth::new(&config.supabase_url, &config.anon_key)?.with_vault(vault));
    let gate = Arc::new(SessionGate::new());
    restore_session(&auth, &gate).await;
    match gate.state() {
        RestoreState::Restored(Some(user)) => println!(
            "  Signed in as {}",
            user.email.as_deref().unwrap_or(&user.id)
        ),
        RestoreState::Restored(None) => println!("  Not signed in"),
        RestoreState::Failed(reason) => println!("  Session restore failed: {}", reason),
        RestoreState::Pending => {}
    }

    let remote = Arc::new(PostgrestClient::new(
        &config.supabase_url,
        &config.anon_key,
        auth.clone(),
    )?);
    let gateway = DataGateway::new(store, remote, auth.clone()).with_session_gate(gate);

    if logout {
        let out = log_out(&auth, &gateway).await;
        match out.error {
            Some(error) => println!("  Logged out locally; server said: {}\n", error),
            None => println!("  Logged out, cache and stored session cleared\n"),
        }
        return Ok(());
    }

    let groups = gateway.load_groups(true).await;
    if let Some(error) = &groups.error {
        println!("  Groups: {}", error);
    }
    let source = if groups.from_cache { "cache" } else { "server" };
    let groups = groups.data.unwrap_or_default();
    println!("  {} group(s) from {}", groups.len(), source);

    for group in &groups {
        let todos = gateway.load_todos(&group.id, true).await;
        let list = todos.data.clone().unwrap_or_default();
        let done = list.iter().filter(|t| t.completed).count();
        print!("    {} [{}]: {}/{} done", group.name, group.theme.as_str(), done, list.len());
        if todos.auth_error {
            print!(" (cached, not signed in)");
        } else if let Some(error) = &todos.error {
            print!(" ({})", error);
        }
        println!();
    }
    println!();
    Ok(())
}

fn print_stats(store: &LocalStore) {
    let Some(stats) = store.cache_stats() else {
        println!("No cached data.");
        return;
    };
    println!("Groups:       {}", stats.groups_count);
    println!("Todo caches:  {}", stats.todo_caches_count);
    println!("Size on disk: {} bytes", stats.total_size);
    match stats
        .last_sync
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
    {
        Some(at) => println!("Last sync:    {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last sync:    never"),
    }
}
