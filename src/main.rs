use anyhow::Context;
use metafetch::{Collector, Metadata, MetadataError, OnError, OnSuccess, Options, Request};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

type Outcome = Arc<Mutex<Option<Result<Metadata, String>>>>;

fn usage() -> anyhow::Error {
    anyhow::anyhow!("usage: metafetch <ip> <port> <peer_id_hex> <info_hash_hex> [announce]")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let ip = args.next().ok_or_else(usage)?;
    let port: u16 = args
        .next()
        .ok_or_else(usage)?
        .parse()
        .context("parse port")?;
    let peer_id = args.next().ok_or_else(usage)?;
    let hash_info = args.next().ok_or_else(usage)?;
    let announce = args.next().filter(|s| !s.trim().is_empty());

    let options = Options::load();
    let collector = Collector::new(options);

    let outcome: Outcome = Arc::default();
    let on_success: OnSuccess = {
        let outcome = outcome.clone();
        Arc::new(move |_: &Request, meta: &Metadata| {
            *outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(Ok(meta.clone()));
        })
    };
    let on_error: OnError = {
        let outcome = outcome.clone();
        Arc::new(move |_: &Request, err: &MetadataError| {
            *outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(Err(err.to_string()));
        })
    };

    let request = Request::new(ip, port, hash_info, peer_id);
    tracing::info!(peer = %request.remote_addr(), magnet = %request.magnet_link(), "resolving");

    tokio::select! {
        res = collector.get_sync(request, Some(on_success), Some(on_error)) => res.context("submit request")?,
        _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
    }
    collector.close();

    let result = outcome
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .context("query finished without a result")?;
    let meta = result.map_err(|err| anyhow::anyhow!("metadata fetch failed: {err}"))?;

    let torrent = meta
        .to_torrent(announce.as_deref())
        .context("build torrent")?;
    let body = torrent.bytes().context("encode torrent")?;

    let path = PathBuf::from(format!("{}.torrent", sanitize_file_name(&torrent.info.name)));
    tokio::fs::write(&path, &body)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = body.len(), "saved torrent");

    println!("{}", serde_json::to_string_pretty(&torrent).context("serialize summary")?);
    Ok(())
}

// Torrent names come from the network.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "metadata".to_string()
    } else {
        cleaned
    }
}
