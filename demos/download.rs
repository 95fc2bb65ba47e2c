//! Download example
//!
//! Streams an image to disk. Run with `RUST_LOG=ferry::progress=debug` to
//! see the progress ratio logged after every chunk.

use ferry::{Client, ClientConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let root = std::env::temp_dir().join("ferry-demo");
    let client = Client::with_config(ClientConfig::for_roots(root.join("cache"), &root))?;

    let response = client
        .download("https://httpbin.org/image/png")
        .to_file(&client.config().download_path)
        .chunk_size(4096)
        .progress(|downloaded, total| {
            if let Some(total) = total {
                println!("Download progress: {downloaded}/{total}");
            }
        })
        .send()
        .await?;

    println!(
        "Downloaded {} bytes to {}",
        response.bytes_downloaded,
        response.file_path.display()
    );
    Ok(())
}
