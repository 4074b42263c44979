use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

use wallet_bridge::bridge::approval::describe;
use wallet_bridge::bridge::{
    ApprovalClient, ApprovalSurface, BridgeServer, Handoff, PendingRequest, RequestKind, Router,
    RouterHandle,
};
use wallet_bridge::keyring::{Keyring, SoftwareKeyring};
use wallet_bridge::storage::{FileStore, KvStore};
use wallet_bridge::{BridgeConfig, BridgeError, ErrorKind};

type Input = Lines<BufReader<Stdin>>;

const PASSWORD_ATTEMPTS: usize = 3;

/// Terminal stand-in for the approval popup
struct ConsoleSurface {
    shown: mpsc::UnboundedSender<Handoff>,
}

#[async_trait]
impl ApprovalSurface for ConsoleSurface {
    async fn open(&self, handoff: &Handoff) -> Result<(), BridgeError> {
        self.shown
            .send(handoff.clone())
            .map_err(|_| BridgeError::unknown("console is gone"))
    }

    async fn close(&self) {
        log::debug!("🪟 Console: approval closed");
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("❌ wallet-bridge: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = BridgeConfig::from_env();
    let store: Arc<dyn KvStore> = Arc::new(FileStore::open(&config.storage_dir)?);
    log::info!("💾 Storage at {}", config.storage_dir.display());

    let keyring = Arc::new(SoftwareKeyring::new(store.clone()));
    let (shown_tx, shown_rx) = mpsc::unbounded_channel();
    let router = Router::spawn(
        &config,
        store,
        keyring.clone(),
        Arc::new(ConsoleSurface { shown: shown_tx }),
    );

    let server = Arc::new(BridgeServer::new(config.port, router.clone()));
    tokio::spawn(console(router, keyring, shown_rx));
    server.start().await
}

async fn console(
    router: RouterHandle,
    keyring: Arc<SoftwareKeyring>,
    mut shown: mpsc::UnboundedReceiver<Handoff>,
) {
    let client = ApprovalClient::new(router.clone());
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut locks = match router.subscribe_locks().await {
        Ok(locks) => locks,
        Err(e) => {
            log::error!("❌ Console: {}", e);
            return;
        }
    };
    print_help();

    loop {
        tokio::select! {
            Some(handoff) = shown.recv() => {
                if let Err(e) = decide(&client, &handoff, &mut input).await {
                    log::error!("❌ Console: {}", e);
                }
            }
            Ok(event) = locks.recv() => {
                keyring.lock_all();
                println!("🔒 Wallet locked ({:?}). Use `unlock <address> <password>`.", event.reason);
            }
            line = input.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = command(&router, &keyring, line.trim()).await {
                        println!("❌ {}", e);
                    }
                }
                Ok(None) => {
                    log::info!("👋 Console: stdin closed, approvals disabled");
                    return;
                }
                Err(e) => {
                    log::error!("❌ Console: {}", e);
                    return;
                }
            }
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  new <name> <password>");
    println!("  import <name> <base58-secret> <password>");
    println!("  accounts | status | lock");
    println!("  unlock <address> <password>");
    println!("  permissions <address>");
    println!("  revoke <address> <origin> | forget <address> <origin>");
}

async fn command(router: &RouterHandle, keyring: &SoftwareKeyring, line: &str) -> Result<(), BridgeError> {
    let args: Vec<&str> = line.split_whitespace().collect();
    match args.as_slice() {
        [] => {}
        ["new", name, password] => {
            let account = keyring.create_account(name, password)?;
            println!("👛 {} {}", account.name, account.address);
        }
        ["import", name, secret, password] => {
            let account = keyring.import_account(name, secret, password)?;
            println!("👛 {} {}", account.name, account.address);
        }
        ["accounts"] => {
            for account in keyring.list_accounts().await? {
                println!("  {} {}", account.name, account.address);
            }
        }
        ["status"] => {
            let status = router.status().await?;
            println!(
                "locked: {} | active: {} | queued: {} | deferred: {} | tabs: {}",
                status.locked,
                status.active.map(|a| a.origin).unwrap_or_else(|| "-".into()),
                status.queued,
                status.deferred,
                status.tabs
            );
        }
        ["lock"] => router.lock().await?,
        ["unlock", address, password] => {
            let replayed = router.unlock(address, password).await?;
            println!("🔓 Unlocked, {} deferred requests replayed", replayed);
        }
        ["permissions", address] => {
            for (origin, granted) in router.permissions(address).await? {
                println!("  {} {}", if granted { "✅" } else { "🚫" }, origin);
            }
        }
        ["revoke", address, origin] => router.revoke(address, origin).await?,
        ["forget", address, origin] => router.forget(address, origin).await?,
        _ => print_help(),
    }
    Ok(())
}

async fn prompt(input: &mut Input, question: &str) -> Result<String, BridgeError> {
    println!("{question}");
    match input.next_line().await {
        Ok(Some(line)) => Ok(line.trim().to_string()),
        Ok(None) => Err(BridgeError::unknown("stdin closed")),
        Err(e) => Err(BridgeError::unknown(e.to_string())),
    }
}

async fn decide(client: &ApprovalClient, handoff: &Handoff, input: &mut Input) -> Result<(), BridgeError> {
    let request = match client.read(handoff).await {
        Ok(request) => request,
        // already expired or cancelled
        Err(e) if e.kind == ErrorKind::RequestExpired => return Ok(()),
        Err(e) => return Err(e),
    };
    println!("🔔 {}", describe(&request));

    match request.kind {
        RequestKind::Connect => decide_connect(client, &request, input).await,
        RequestKind::Sign => decide_sign(client, &request, input).await,
    }
}

async fn decide_connect(
    client: &ApprovalClient,
    request: &PendingRequest,
    input: &mut Input,
) -> Result<(), BridgeError> {
    let address = prompt(input, "Address to share (blank to reject):").await?;
    if address.is_empty() {
        client.reject(request).await?;
        return Ok(());
    }
    for _ in 0..PASSWORD_ATTEMPTS {
        let password = prompt(input, "Password:").await?;
        match client.approve_connect(request, vec![address.clone()], &password).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind == ErrorKind::InvalidPassword => println!("❌ Wrong password"),
            // held until unlock, shown again then
            Err(e) if e.kind == ErrorKind::WalletLocked => return Ok(()),
            Err(e) => {
                client.reject(request).await?;
                return Err(e);
            }
        }
    }
    client.reject(request).await?;
    Ok(())
}

async fn decide_sign(
    client: &ApprovalClient,
    request: &PendingRequest,
    input: &mut Input,
) -> Result<(), BridgeError> {
    let answer = prompt(input, "Sign? [y/N]").await?;
    if !answer.eq_ignore_ascii_case("y") {
        client.reject(request).await?;
        return Ok(());
    }
    for _ in 0..PASSWORD_ATTEMPTS {
        let password = prompt(input, "Password:").await?;
        match client.approve_sign(request, &password).await {
            Ok(_) => {
                println!("✅ Signed");
                return Ok(());
            }
            Err(e) if e.kind == ErrorKind::InvalidPassword => println!("❌ Wrong password"),
            Err(e) if e.kind == ErrorKind::WalletLocked => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    client.reject(request).await?;
    Ok(())
}
