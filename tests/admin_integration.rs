mod support;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use cachegate::protocol::CacheRequest;
use cachegate::{CacheOutcome, ResponseCache, admin};

use support::*;

async fn start_admin(cache: ResponseCache) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(admin::serve_listener(listener, cache));
    Ok(addr)
}

async fn request(addr: std::net::SocketAddr, method: &str, target: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(format!("{method} {target} HTTP/1.1\r\nHost: admin\r\n\r\n").as_bytes())
        .await?;
    let mut out = String::new();
    stream.read_to_string(&mut out).await?;
    Ok(out)
}

fn body_json(response: &str) -> Result<serde_json::Value> {
    let (_, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("response without body: {response}"))?;
    Ok(serde_json::from_str(body)?)
}

#[tokio::test]
async fn status_lists_cached_resources() -> Result<()> {
    let (cache, _store, _clock) = memory_cache(16);
    let handler = ScriptedHandler::ok(b"x").with_header("cache-control", "max-age=60");
    let req = CacheRequest::get("a.example", "/index");
    fetch(&cache, &req, &handler);
    fetch(&cache, &req, &handler);

    let addr = start_admin(cache).await?;
    let response = request(addr, "GET", "/cache/status").await?;
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected: {response}");

    let status = body_json(&response)?;
    assert_eq!(status["stats"]["hits"], 1);
    assert_eq!(status["stats"]["misses"], 1);
    assert_eq!(status["items"][0]["host"], "a.example");
    assert_eq!(status["items"][0]["cached"], true);
    Ok(())
}

#[tokio::test]
async fn clear_by_pattern_drops_matching_resources() -> Result<()> {
    let (cache, _store, _clock) = memory_cache(16);
    let handler = ScriptedHandler::ok(b"x").with_header("cache-control", "max-age=60");
    let img = CacheRequest::get("h", "/img/a");
    let css = CacheRequest::get("h", "/css/a");
    fetch(&cache, &img, &handler);
    fetch(&cache, &css, &handler);

    let addr = start_admin(cache.clone()).await?;
    let response = request(addr, "POST", "/cache/clear?path=%5E%2Fimg%2F").await?;
    assert_eq!(body_json(&response)?["cleared"], 1);

    assert_eq!(fetch(&cache, &css, &handler).0, CacheOutcome::Hit);
    assert_eq!(fetch(&cache, &img, &handler).0, CacheOutcome::Filled);
    Ok(())
}

#[tokio::test]
async fn disable_turns_cache_into_pass_through() -> Result<()> {
    let (cache, _store, _clock) = memory_cache(16);
    let handler = ScriptedHandler::ok(b"x").with_header("cache-control", "max-age=60");
    let req = CacheRequest::get("h", "/p");
    fetch(&cache, &req, &handler);

    let addr = start_admin(cache.clone()).await?;
    let response = request(addr, "POST", "/cache/disable").await?;
    assert_eq!(body_json(&response)?["enabled"], false);
    assert_eq!(fetch(&cache, &req, &handler).0, CacheOutcome::Bypass);

    request(addr, "POST", "/cache/enable").await?;
    assert_eq!(fetch(&cache, &req, &handler).0, CacheOutcome::Filled);
    Ok(())
}

#[tokio::test]
async fn wrong_method_and_unknown_path() -> Result<()> {
    let (cache, _store, _clock) = memory_cache(16);
    let addr = start_admin(cache).await?;
    let response = request(addr, "GET", "/cache/clear").await?;
    assert!(response.starts_with("HTTP/1.1 405"), "unexpected: {response}");
    let response = request(addr, "GET", "/elsewhere").await?;
    assert!(response.starts_with("HTTP/1.1 404"), "unexpected: {response}");
    Ok(())
}
