/// Example: Coordinated Token Refresh
///
/// Eight concurrent callers find the access token expired. Only one refresh
/// reaches the (simulated) auth server; every caller gets its result.
///
/// Run:
/// RUST_LOG=keygate=debug cargo run --example token_refresh
use async_trait::async_trait;
use keygate::prelude::*;
use keygate::token::now_ms;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Auth server that rotates refresh tokens and takes a while to answer
struct RotatingAuthServer {
    issued: AtomicUsize,
}

#[async_trait]
impl TokenEndpoint for RotatingAuthServer {
    async fn refresh(&self, refresh_token: &str) -> keygate::error::Result<TokenGrant> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 2;
        println!("  auth server: exchanging {} (call #{})", refresh_token, n - 1);
        Ok(TokenGrant {
            access_token: format!("access_{}", n),
            expires_in: 3600,
            refresh_token: Some(format!("refresh_{}", n)),
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Coordinated Token Refresh Example ===\n");

    let store = Arc::new(MemoryStore::with_credentials(&Credentials {
        access_token: "access_1".to_string(),
        refresh_token: "refresh_1".to_string(),
        expires_at_ms: now_ms() - 1_000,
    }));
    let server = Arc::new(RotatingAuthServer {
        issued: AtomicUsize::new(0),
    });
    let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), server.clone()));

    println!("Stored access token expired; 8 callers ask for a fresh one...");
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { (i, coordinator.ensure_fresh_token().await) })
        })
        .collect();

    for handle in handles {
        match handle.await {
            Ok((i, Some(token))) => println!("  caller {} got {}", i, token),
            Ok((i, None)) => println!("  caller {} got no token", i),
            Err(e) => eprintln!("  caller panicked: {}", e),
        }
    }

    println!(
        "\nRefresh calls made: {}",
        server.issued.load(Ordering::SeqCst)
    );
    println!(
        "Stored refresh token is now: {}",
        store
            .get(CredentialKey::RefreshToken)
            .ok()
            .flatten()
            .unwrap_or_default()
    );

    println!("\nLogging out...");
    if let Err(e) = coordinator.purge() {
        eprintln!("✗ Failed to purge credentials: {}", e);
    } else {
        println!("✓ Credentials purged");
    }
}
