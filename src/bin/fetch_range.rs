use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use rangecache::config::{CacheConfig, HttpConfig};
use rangecache::fetcher::{FileRangeFetcher, HttpRangeFetcher, RangeFetcher};
use rangecache::StreamingRangeCache;

const BEARER_TOKEN_VAR: &str = "RANGECACHE_BEARER_TOKEN";

#[tokio::main]
async fn main() {
    // Use RUST_LOG env var if set, otherwise default to info level
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 || args.len() > 5 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let source = &args[1];
    let offset: u64 = match args[2].parse() {
        Ok(offset) => offset,
        Err(_) => {
            error!("Invalid offset: {}", args[2]);
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };
    let length: u64 = match args[3].parse() {
        Ok(length) => length,
        Err(_) => {
            error!("Invalid length: {}", args[3]);
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };
    let output = args.get(4).map(PathBuf::from);

    let config = match CacheConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let fetcher: Arc<dyn RangeFetcher> = if is_url(source) {
        let http_config = HttpConfig {
            bearer_token: env::var(BEARER_TOKEN_VAR).ok(),
            ..HttpConfig::default()
        };
        match HttpRangeFetcher::connect(source.as_str(), http_config).await {
            Ok(fetcher) => Arc::new(fetcher),
            Err(e) => {
                error!("Failed to connect to {}: {}", source, e);
                std::process::exit(1);
            }
        }
    } else {
        match FileRangeFetcher::open(source).await {
            Ok(fetcher) => Arc::new(fetcher),
            Err(e) => {
                error!("Failed to open {}: {}", source, e);
                std::process::exit(1);
            }
        }
    };

    let cache = match StreamingRangeCache::new(fetcher, config) {
        Ok(cache) => cache,
        Err(e) => {
            error!("Failed to create cache: {}", e);
            std::process::exit(1);
        }
    };

    let data = match read_all(&cache, offset, length).await {
        Ok(data) => data,
        Err(e) => {
            error!("Read failed: {}", e);
            std::process::exit(1);
        }
    };
    cache.close();

    let written = match &output {
        Some(path) => std::fs::write(path, &data),
        None => std::io::stdout().lock().write_all(&data),
    };
    if let Err(e) = written {
        error!("Failed to write output: {}", e);
        std::process::exit(1);
    }

    match output {
        Some(path) => info!("Wrote {} bytes to {}", data.len(), path.display()),
        None => info!("Wrote {} bytes", data.len()),
    }
}

/// Read `length` bytes at `offset` in pieces no larger than the cache allows
async fn read_all(
    cache: &StreamingRangeCache,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, rangecache::CacheError> {
    let max_request_size = cache.budget().max_request_size;
    let mut data = Vec::with_capacity(length.min(64 * 1024 * 1024) as usize);
    let mut position = offset;
    let end = offset.saturating_add(length);

    while position < end {
        let piece = (end - position).min(max_request_size);
        let bytes = cache.read(position, piece).await?;
        position += bytes.len() as u64;
        data.extend_from_slice(&bytes);
    }

    Ok(data)
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} <url-or-path> <offset> <length> [output]", program);
    eprintln!();
    eprintln!("Reads a byte range through the streaming cache and writes it to");
    eprintln!("stdout, or to [output] when given.");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RANGECACHE_CACHE_SIZE           cache budget in bytes, or 'unbounded'");
    eprintln!("  RANGECACHE_BLOCK_SIZE           block size in bytes");
    eprintln!("  RANGECACHE_CONTINUE_THRESHOLD   hysteresis distance in bytes");
    eprintln!("  RANGECACHE_MAX_RETRIES          retries per failed connection");
    eprintln!("  RANGECACHE_RETRY_DELAY_MS       first retry delay");
    eprintln!("  {}         bearer token for HTTP sources", BEARER_TOKEN_VAR);
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} https://example.com/recording.bin 0 1048576 head.bin", program);
    eprintln!("  {} ./recording.bin 5000000 4096", program);
}
